use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MAX_PROMPT_CHARS: usize = 1000;

pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_GUIDANCE: f64 = 7.5;
pub const DEFAULT_SIZE: u32 = 512;
/// Seed value asking for a random seed.
pub const RANDOM_SEED: i64 = -1;

pub const STEPS_RANGE: RangeInclusive<i64> = 1..=150;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 0.0..=30.0;
pub const SIZE_RANGE: RangeInclusive<i64> = 64..=2048;

/// Generation request as sent by clients. Absent fields take their defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub steps: Option<i64>,
    pub guidance: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub seed: Option<i64>,
}

/// Validated generation parameters with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub steps: usize,
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
    /// `None` asks for a fresh random seed.
    pub seed: Option<u64>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            steps: DEFAULT_STEPS as usize,
            guidance: DEFAULT_GUIDANCE,
            width: DEFAULT_SIZE as usize,
            height: DEFAULT_SIZE as usize,
            seed: None,
        }
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt.chars().count()
    }
}

impl GenerationRequest {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn validate(self) -> Result<GenerationParams> {
        let prompt = self
            .prompt
            .ok_or_else(|| Error::validation("Prompt is required"))?;
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(Error::validation(format!(
                "Prompt too long (max {MAX_PROMPT_CHARS} characters)"
            )));
        }
        if prompt.trim().is_empty() {
            return Err(Error::validation("Prompt must not be empty"));
        }

        let steps = self.steps.unwrap_or(DEFAULT_STEPS.into());
        if !STEPS_RANGE.contains(&steps) {
            return Err(Error::validation(format!(
                "steps must be between {} and {}",
                STEPS_RANGE.start(),
                STEPS_RANGE.end()
            )));
        }

        let guidance = self.guidance.unwrap_or(DEFAULT_GUIDANCE);
        if !guidance.is_finite() || !GUIDANCE_RANGE.contains(&guidance) {
            return Err(Error::validation(format!(
                "guidance must be between {} and {}",
                GUIDANCE_RANGE.start(),
                GUIDANCE_RANGE.end()
            )));
        }

        let width = dimension("width", self.width)?;
        let height = dimension("height", self.height)?;

        let seed = match self.seed.unwrap_or(RANDOM_SEED) {
            RANDOM_SEED => None,
            seed if seed >= 0 => Some(seed as u64),
            _ => {
                return Err(Error::validation(
                    "seed must be -1 (random) or a non-negative integer",
                ))
            }
        };

        Ok(GenerationParams {
            prompt,
            steps: steps as usize,
            guidance,
            width,
            height,
            seed,
        })
    }
}

fn dimension(name: &str, value: Option<i64>) -> Result<usize> {
    let value = value.unwrap_or(DEFAULT_SIZE.into());
    if !SIZE_RANGE.contains(&value) {
        return Err(Error::validation(format!(
            "{name} must be between {} and {}",
            SIZE_RANGE.start(),
            SIZE_RANGE.end()
        )));
    }
    if value % 8 != 0 {
        return Err(Error::validation(format!("{name} must be a multiple of 8")));
    }
    Ok(value as usize)
}
