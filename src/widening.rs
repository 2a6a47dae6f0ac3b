//! Age-driven widening of the tolerated rank gap.

use crate::config::WideningConfig;

/// Maximum rank difference tolerated for a ticket of the given age.
///
/// Grows in whole steps: `floor(age_ms / step_ms) * step_diff`, capped at
/// `cap`. Monotonically non-decreasing in age; zero below the first step.
pub fn allowed_diff(age_ms: u64, config: &WideningConfig) -> u32 {
    if config.step_ms == 0 {
        // Degenerate schedule: widen fully from the start.
        return config.cap;
    }
    let steps = age_ms / config.step_ms;
    let widened = steps.saturating_mul(u64::from(config.step_diff));
    widened.min(u64::from(config.cap)) as u32
}
