//! Per-slide recovery state and results.
//!
//! # Invariants
//! - `retry_count` never decreases except through `initialize_slide`.
//! - `SlideStatus::Failed` implies `retry_count >= max_retries` of the call that set it.
//! - A `RecoveryResult` is always well-formed; `success` alone decides whether
//!   the slide can be rendered from `recovered_data`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const PLACEHOLDER_TITLE: &str = "Content unavailable";
pub const PLACEHOLDER_NOTICE: &str =
    "Something went wrong while generating this slide. Please try again later.";

/// Lifecycle of one slide in the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlideStatus {
    Healthy,
    Error,
    Recovering,
    /// Soft terminal; a later `report_error` re-enters `Error`.
    Recovered,
    /// Retries exhausted. `report_error` re-enters `Error`; only
    /// `initialize_slide` restores the retry budget.
    Failed,
}

impl SlideStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Error => "error",
            Self::Recovering => "recovering",
            Self::Recovered => "recovered",
            Self::Failed => "failed",
        }
    }

    /// Whether the slide currently needs attention from the UI.
    pub fn is_broken(self) -> bool {
        matches!(self, Self::Error | Self::Failed)
    }
}

impl Display for SlideStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one slide's recovery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideRecoveryState {
    pub slide_id: String,
    pub status: SlideStatus,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Epoch milliseconds of the last error report or recovery attempt.
    pub last_attempt: Option<i64>,
}

impl SlideRecoveryState {
    pub fn healthy(slide_id: impl Into<String>) -> Self {
        Self {
            slide_id: slide_id.into(),
            status: SlideStatus::Healthy,
            error_type: None,
            error_message: None,
            retry_count: 0,
            last_attempt: None,
        }
    }
}

/// Policy applied once a slide has used up its retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Report failure; the caller omits the slide.
    Skip,
    /// Serve the stored previous version, or a placeholder when none exists.
    Previous,
    /// Serve a synthesized blank slide.
    #[default]
    Placeholder,
}

impl FallbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Previous => "previous",
            Self::Placeholder => "placeholder",
        }
    }
}

impl Display for FallbackStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "previous" => Ok(Self::Previous),
            "placeholder" => Ok(Self::Placeholder),
            other => Err(format!(
                "unsupported fallback strategy `{other}`; expected skip|previous|placeholder"
            )),
        }
    }
}

/// Minimal stand-in rendered in place of an unrecoverable slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderSlide {
    pub slide_id: String,
    pub title: String,
    pub notice: String,
    pub is_placeholder: bool,
}

impl PlaceholderSlide {
    pub fn for_slide(slide_id: impl Into<String>) -> Self {
        Self {
            slide_id: slide_id.into(),
            title: PLACEHOLDER_TITLE.to_string(),
            notice: PLACEHOLDER_NOTICE.to_string(),
            is_placeholder: true,
        }
    }
}

/// Data a successful recovery hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredData<D> {
    /// Produced by the caller's recovery action.
    Recovered(D),
    /// Last known-good snapshot.
    Previous(D),
    Placeholder(PlaceholderSlide),
}

impl<D> RecoveredData<D> {
    /// The slide payload, unless this is a placeholder.
    pub fn payload(&self) -> Option<&D> {
        match self {
            Self::Recovered(data) | Self::Previous(data) => Some(data),
            Self::Placeholder(_) => None,
        }
    }

    pub fn placeholder(&self) -> Option<&PlaceholderSlide> {
        match self {
            Self::Placeholder(slide) => Some(slide),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

/// Resolved outcome of one `recover_slide` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult<D> {
    pub slide_id: String,
    pub success: bool,
    pub message: String,
    pub recovered_data: Option<RecoveredData<D>>,
}

impl<D> RecoveryResult<D> {
    pub(crate) fn succeeded(
        slide_id: &str,
        message: impl Into<String>,
        recovered_data: Option<RecoveredData<D>>,
    ) -> Self {
        Self {
            slide_id: slide_id.to_string(),
            success: true,
            message: message.into(),
            recovered_data,
        }
    }

    pub(crate) fn failed(slide_id: &str, message: impl Into<String>) -> Self {
        Self {
            slide_id: slide_id.to_string(),
            success: false,
            message: message.into(),
            recovered_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FallbackStrategy, PlaceholderSlide, RecoveredData, SlideStatus};

    #[test]
    fn fallback_strategy_parses_case_insensitively() {
        assert_eq!(
            " Previous ".parse::<FallbackStrategy>().unwrap(),
            FallbackStrategy::Previous
        );
        assert!("retry".parse::<FallbackStrategy>().is_err());
        assert_eq!(FallbackStrategy::default(), FallbackStrategy::Placeholder);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&SlideStatus::Recovering).unwrap();
        assert_eq!(json, "\"recovering\"");
        assert!(SlideStatus::Failed.is_broken());
        assert!(!SlideStatus::Recovered.is_broken());
    }

    #[test]
    fn placeholder_data_has_no_payload() {
        let data: RecoveredData<String> =
            RecoveredData::Placeholder(PlaceholderSlide::for_slide("s1"));
        assert!(data.is_placeholder());
        assert!(data.payload().is_none());
        assert_eq!(data.placeholder().unwrap().slide_id, "s1");

        let previous = RecoveredData::Previous("v1".to_string());
        assert_eq!(previous.payload().map(String::as_str), Some("v1"));
    }
}
