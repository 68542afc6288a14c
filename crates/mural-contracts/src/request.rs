use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Rejection of caller-supplied input, raised before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,
    #[error("Unsupported aspect ratio: {0}")]
    UnsupportedAspectRatio(String),
}

/// Aspect ratios the Gemini image endpoint accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait3x4,
    #[serde(rename = "4:3")]
    Landscape4x3,
    #[serde(rename = "4:5")]
    Portrait4x5,
    #[serde(rename = "5:4")]
    Landscape5x4,
    #[serde(rename = "9:16")]
    Portrait9x16,
    #[serde(rename = "16:9")]
    Landscape16x9,
    #[serde(rename = "21:9")]
    Ultrawide21x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 8] = [
        AspectRatio::Square,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait4x5,
        AspectRatio::Landscape5x4,
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
        AspectRatio::Ultrawide21x9,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Landscape5x4 => "5:4",
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Ultrawide21x9 => "21:9",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = InputError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        AspectRatio::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == trimmed)
            .ok_or_else(|| InputError::UnsupportedAspectRatio(raw.to_string()))
    }
}

/// Everything one batch invocation needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Prompts, one remote generation per entry, processed in order.
    pub prompts: Vec<String>,
    /// Output path; batches of more than one prompt get `_001`, `_002`, ...
    /// inserted before the extension.
    pub output: PathBuf,
    /// Optional style template prepended to every prompt.
    pub style: Option<PathBuf>,
    /// Optional image to edit, sent with every prompt.
    pub edit: Option<PathBuf>,
    /// Reference images, sent with every prompt.
    pub references: Vec<PathBuf>,
    pub aspect_ratio: AspectRatio,
    pub model: String,
    /// Retry budget per item, on top of the first attempt.
    pub max_retries: u32,
    /// Per-call HTTP timeout.
    pub timeout_seconds: u64,
}

impl BatchRequest {
    pub fn new(prompts: Vec<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            prompts,
            output: output.into(),
            style: None,
            edit: None,
            references: Vec::new(),
            aspect_ratio: AspectRatio::default(),
            model: DEFAULT_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn aspect_ratio_parses_known_values() {
        assert_eq!("1:1".parse::<AspectRatio>(), Ok(AspectRatio::Square));
        assert_eq!(
            " 16:9 ".parse::<AspectRatio>(),
            Ok(AspectRatio::Landscape16x9)
        );
        assert_eq!(
            "21:9".parse::<AspectRatio>(),
            Ok(AspectRatio::Ultrawide21x9)
        );
    }

    #[test]
    fn aspect_ratio_rejects_unknown_values() {
        let err = "2:1".parse::<AspectRatio>().unwrap_err();
        assert_eq!(err, InputError::UnsupportedAspectRatio("2:1".to_string()));
        assert!("".parse::<AspectRatio>().is_err());
        assert!("square".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn aspect_ratio_serde_round_trips_ratio_strings() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_value(AspectRatio::Portrait9x16)?, json!("9:16"));
        assert_eq!(
            serde_json::from_value::<AspectRatio>(json!("4:5"))?,
            AspectRatio::Portrait4x5
        );
        Ok(())
    }

    #[test]
    fn batch_request_defaults() {
        let request = BatchRequest::new(vec!["cube".to_string()], "out.png");
        assert_eq!(request.model, DEFAULT_MODEL);
        assert_eq!(request.max_retries, 3);
        assert_eq!(request.timeout_seconds, 60);
        assert_eq!(request.aspect_ratio, AspectRatio::Square);
        assert!(request.style.is_none());
        assert!(request.references.is_empty());
    }
}
