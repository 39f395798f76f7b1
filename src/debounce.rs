//! Repeat suppression for decoded payloads
//!
//! A code held in front of the camera decodes on every frame. Only the most
//! recently reported payload is remembered: a repeat of it inside the window
//! is dropped, anything else is reported. Two codes shown alternately are
//! therefore both reported every time.

use std::time::Duration;
use tokio::time::Instant;

/// Default suppression window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

/// Last reported payload and when it was reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceState {
    /// Payload of the most recent report
    pub last_payload: Option<String>,
    /// Time of the most recent report; never moves backwards
    pub last_seen_at: Option<Instant>,
}

/// Single-slot debounce policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceEngine {
    window: Duration,
}

impl DebounceEngine {
    /// Suppress repeats seen within `window` of the last report
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Configured suppression window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether `payload` seen at `now` should be reported.
    ///
    /// Suppressed repeats leave `state` untouched, so a code held in view is
    /// reported again once per window.
    pub fn should_report(&self, state: &mut DebounceState, payload: &str, now: Instant) -> bool {
        if let (Some(last), Some(seen_at)) = (state.last_payload.as_deref(), state.last_seen_at) {
            if last == payload && now.saturating_duration_since(seen_at) < self.window {
                return false;
            }
        }

        let seen_at = match state.last_seen_at {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        state.last_payload = Some(payload.to_string());
        state.last_seen_at = Some(seen_at);
        true
    }
}

impl Default for DebounceEngine {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_repeat_inside_window_is_suppressed() {
        let engine = DebounceEngine::default();
        let base = Instant::now();
        for gap in [0, 1, 999, 1_999] {
            let mut state = DebounceState::default();
            assert!(engine.should_report(&mut state, "X", at(base, 0)));
            assert!(
                !engine.should_report(&mut state, "X", at(base, gap)),
                "gap {gap}ms should be suppressed"
            );
        }
    }

    #[test]
    fn test_repeat_at_or_after_window_is_reported() {
        let engine = DebounceEngine::default();
        let base = Instant::now();
        for gap in [2_000, 2_001, 60_000] {
            let mut state = DebounceState::default();
            assert!(engine.should_report(&mut state, "X", at(base, 0)));
            assert!(
                engine.should_report(&mut state, "X", at(base, gap)),
                "gap {gap}ms should be reported"
            );
        }
    }

    #[test]
    fn test_different_payloads_never_suppress_each_other() {
        let engine = DebounceEngine::default();
        let now = Instant::now();

        let mut state = DebounceState::default();
        assert!(engine.should_report(&mut state, "A", now));
        assert!(engine.should_report(&mut state, "B", now));

        let mut state = DebounceState::default();
        assert!(engine.should_report(&mut state, "B", now));
        assert!(engine.should_report(&mut state, "A", now));
    }

    #[test]
    fn test_alternating_payloads_are_all_reported() {
        let engine = DebounceEngine::default();
        let base = Instant::now();
        let mut state = DebounceState::default();

        let reported: Vec<bool> = ["A", "B", "A", "B", "A", "B"]
            .iter()
            .enumerate()
            .map(|(i, payload)| engine.should_report(&mut state, payload, at(base, i as u64 * 100)))
            .collect();
        assert!(reported.iter().all(|r| *r));
    }

    #[test]
    fn test_suppression_does_not_extend_window() {
        let engine = DebounceEngine::default();
        let base = Instant::now();
        let mut state = DebounceState::default();

        assert!(engine.should_report(&mut state, "X", at(base, 0)));
        assert!(!engine.should_report(&mut state, "X", at(base, 1_500)));
        assert_eq!(state.last_seen_at, Some(at(base, 0)));
        assert!(engine.should_report(&mut state, "X", at(base, 2_100)));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let engine = DebounceEngine::default();
        let base = Instant::now();
        let mut state = DebounceState::default();

        assert!(engine.should_report(&mut state, "A", at(base, 5_000)));
        assert!(engine.should_report(&mut state, "B", at(base, 1_000)));
        assert_eq!(state.last_payload.as_deref(), Some("B"));
        assert_eq!(state.last_seen_at, Some(at(base, 5_000)));
    }
}
