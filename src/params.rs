//! Generation parameter validation.
//!
//! Every constraint is checked and all violations are reported together, so
//! a caller sees the full list in one [`WeavrError::InvalidParameters`].

use serde::Serialize;

use crate::config::GenerationConfig;
use crate::error::{ParamViolation, Result, WeavrError};

/// Sampling parameters for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    /// Must lie in `[0, 1]`.
    pub temperature: f32,
    /// Maximum output length in tokens; must be at least 1.
    pub max_tokens: i64,
    /// Nucleus sampling cutoff in `(0, 1]`, when set.
    pub top_p: Option<f32>,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            top_p: config.top_p,
        }
    }

    /// Check every constraint, returning the parameters unchanged when valid.
    pub fn validate(self) -> Result<Self> {
        let mut violations = Vec::new();

        if !(0.0..=1.0).contains(&self.temperature) {
            violations.push(ParamViolation::TemperatureOutOfRange(self.temperature));
        }
        if self.max_tokens < 1 {
            violations.push(ParamViolation::MaxTokensNotPositive(self.max_tokens));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                violations.push(ParamViolation::TopPOutOfRange(p));
            }
        }

        if violations.is_empty() {
            Ok(self)
        } else {
            Err(WeavrError::InvalidParameters(violations))
        }
    }

    /// Force every field into its valid range.
    ///
    /// NaN temperature becomes 0. Never applied implicitly.
    pub fn clamped(self) -> Self {
        let temperature = if self.temperature.is_nan() {
            0.0
        } else {
            self.temperature.clamp(0.0, 1.0)
        };
        let top_p = self.top_p.map(|p| {
            if p.is_nan() || p <= 0.0 {
                f32::MIN_POSITIVE
            } else {
                p.min(1.0)
            }
        });
        Self {
            temperature,
            max_tokens: self.max_tokens.max(1),
            top_p,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// Validate a parameter set.
pub fn validate(params: GenerationParams) -> Result<GenerationParams> {
    params.validate()
}
