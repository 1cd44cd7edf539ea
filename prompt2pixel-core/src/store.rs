use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use image::{DynamicImage, ImageFormat};
use uuid::Uuid;

use crate::{Error, Result};

const PREFIX: &str = "image_";
const EXTENSION: &str = "png";

/// Flat directory of generated images.
///
/// Files are written once under a fresh `image_<uuid>.png` name and never
/// touched again; removal is left to whoever manages the directory.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn new_filename() -> String {
        format!("{PREFIX}{}.{EXTENSION}", Uuid::new_v4().simple())
    }

    /// Whether `name` follows the naming scheme of [`ImageStore::new_filename`].
    pub fn is_generated_name(name: &str) -> bool {
        name.strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_suffix(&format!(".{EXTENSION}")))
            .is_some_and(|id| {
                id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            })
    }

    /// Encodes `image` as PNG and returns the filename it was stored under.
    ///
    /// The image goes to a hidden temporary file first and is renamed into
    /// place, so readers never see a partial file.
    pub fn save(&self, image: &DynamicImage) -> anyhow::Result<String> {
        let filename = Self::new_filename();
        let tmp = self.root.join(format!(".{filename}.tmp"));
        let written = image
            .save_with_format(&tmp, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", tmp.display()))
            .and_then(|()| {
                std::fs::rename(&tmp, self.root.join(&filename))
                    .with_context(|| format!("failed to move image into place as {filename}"))
            });
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        written.map(|()| filename)
    }

    /// Maps a client supplied filename to a path inside the store.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        if !is_safe_filename(filename) {
            return Err(Error::InvalidFilename(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    /// Reads a stored image, returning its bytes and content type.
    pub async fn read(&self, filename: &str) -> Result<(Vec<u8>, &'static str)> {
        let path = self.resolve(filename)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((bytes, content_type(filename))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(filename.to_string()))
            }
            // Reading a directory fails with a platform specific kind.
            Err(_) if path.is_dir() => Err(Error::NotFound(filename.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

/// A single path component that cannot leave the store directory.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0', ':'])
}

pub fn content_type(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
