//! Fallback selection for slides that ran out of retries.

use crate::model::recovery::{FallbackStrategy, PlaceholderSlide, RecoveredData, RecoveryResult};
use log::info;

pub const MESSAGE_SKIPPED: &str = "skipped";
pub const MESSAGE_PREVIOUS: &str = "restored previous version";
pub const MESSAGE_PLACEHOLDER: &str = "replaced with placeholder";

/// Resolves `strategy` for `slide_id`.
///
/// `previous` is the stored known-good snapshot, if any. `Previous` without a
/// snapshot degrades to `Placeholder`. Only `Skip` reports failure.
pub fn resolve_fallback<D: Clone>(
    slide_id: &str,
    strategy: FallbackStrategy,
    previous: Option<&D>,
) -> RecoveryResult<D> {
    let result = match (strategy, previous) {
        (FallbackStrategy::Skip, _) => RecoveryResult::failed(slide_id, MESSAGE_SKIPPED),
        (FallbackStrategy::Previous, Some(snapshot)) => RecoveryResult::succeeded(
            slide_id,
            MESSAGE_PREVIOUS,
            Some(RecoveredData::Previous(snapshot.clone())),
        ),
        (FallbackStrategy::Previous, None) | (FallbackStrategy::Placeholder, _) => {
            placeholder_result(slide_id)
        }
    };
    info!(
        "event=fallback_applied module=recovery slide_id={} strategy={} served={}",
        slide_id,
        strategy,
        served_kind(&result)
    );
    result
}

fn placeholder_result<D>(slide_id: &str) -> RecoveryResult<D> {
    RecoveryResult::succeeded(
        slide_id,
        MESSAGE_PLACEHOLDER,
        Some(RecoveredData::Placeholder(PlaceholderSlide::for_slide(
            slide_id,
        ))),
    )
}

fn served_kind<D>(result: &RecoveryResult<D>) -> &'static str {
    match &result.recovered_data {
        None => "nothing",
        Some(RecoveredData::Placeholder(_)) => "placeholder",
        Some(RecoveredData::Previous(_)) => "previous",
        Some(RecoveredData::Recovered(_)) => "recovered",
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_fallback, MESSAGE_PLACEHOLDER, MESSAGE_SKIPPED};
    use crate::model::recovery::{FallbackStrategy, RecoveredData};

    #[test]
    fn skip_reports_failure_even_with_snapshot() {
        let previous = "v1".to_string();
        let result = resolve_fallback("s1", FallbackStrategy::Skip, Some(&previous));
        assert!(!result.success);
        assert_eq!(result.message, MESSAGE_SKIPPED);
        assert!(result.recovered_data.is_none());
    }

    #[test]
    fn previous_serves_snapshot_copy() {
        let previous = vec![1, 2, 3];
        let result = resolve_fallback("s1", FallbackStrategy::Previous, Some(&previous));
        assert!(result.success);
        assert_eq!(result.recovered_data, Some(RecoveredData::Previous(vec![1, 2, 3])));
    }

    #[test]
    fn previous_without_snapshot_degrades_to_placeholder() {
        let result = resolve_fallback::<String>("s9", FallbackStrategy::Previous, None);
        assert!(result.success);
        assert_eq!(result.message, MESSAGE_PLACEHOLDER);
        let placeholder = result
            .recovered_data
            .as_ref()
            .and_then(RecoveredData::placeholder)
            .expect("placeholder expected");
        assert_eq!(placeholder.slide_id, "s9");
        assert!(placeholder.is_placeholder);
    }
}
