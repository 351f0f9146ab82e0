//! Property-based tests for the bounded-memory and failure-isolation parts.
//!
//! # Properties Tested
//!
//! 1. **Hotkey Cap**: the detector never tracks more than `max_tracked_keys`
//! 2. **Hotkey Counts**: tracked keys count every access; hot means count > threshold
//! 3. **Hotkey Ranking**: `hotkeys(n)` is sorted by count and never longer than `n`
//! 4. **Breaker Trip**: the breaker opens exactly when the rolling error
//!    percentage reaches the threshold with enough volume
//! 5. **Key Patterns**: SCAN patterns match their own index keys literally, and
//!    index keys parse back into the ids they were built from

use proptest::prelude::*;
use session_cache::backend::glob_match;
use session_cache::breaker::CircuitState;
use session_cache::config::{BreakerConfig, HotkeyConfig};
use session_cache::key::SessionKeys;
use session_cache::{CircuitBreaker, Error, HotkeyDetector};
use std::collections::HashMap;
use std::time::Duration;

fn detector(threshold: u64, cap: usize) -> HotkeyDetector {
    HotkeyDetector::new(HotkeyConfig {
        threshold,
        window: Duration::from_secs(3600),
        buckets: 60,
        max_tracked_keys: cap,
        sweep_interval: Duration::from_secs(3600),
    })
}

/// Replays `accesses` and returns the first-seen order of keys.
fn replay(detector: &HotkeyDetector, accesses: &[u8]) -> Vec<String> {
    let mut seen = Vec::new();
    for id in accesses {
        let key = format!("key:{}", id);
        if !seen.contains(&key) {
            seen.push(key.clone());
        }
        detector.track(&key);
    }
    seen
}

// ============================================================================
// Property 1-3: Hotkey detector
// ============================================================================

proptest! {
    #[test]
    fn prop_tracked_keys_never_exceed_cap(
        accesses in prop::collection::vec(0u8..64, 0..400),
        cap in 1usize..32,
    ) {
        let detector = detector(5, cap);
        let seen = replay(&detector, &accesses);

        prop_assert!(detector.tracked() <= cap);
        prop_assert_eq!(detector.tracked(), seen.len().min(cap));
        let stats = detector.stats(0);
        prop_assert_eq!(stats.tracked, detector.tracked());
    }

    #[test]
    fn prop_counts_and_hotness(
        accesses in prop::collection::vec(0u8..16, 0..300),
        threshold in 0u64..20,
    ) {
        let detector = detector(threshold, 1024);
        replay(&detector, &accesses);

        let mut expected: HashMap<String, u64> = HashMap::new();
        for id in &accesses {
            *expected.entry(format!("key:{}", id)).or_default() += 1;
        }
        for (key, count) in &expected {
            prop_assert_eq!(detector.count(key), *count);
            prop_assert_eq!(detector.is_hotkey(key), *count > threshold);
        }
        prop_assert!(!detector.is_hotkey("key:never-seen"));
    }

    #[test]
    fn prop_hotkeys_ranked_and_bounded(
        accesses in prop::collection::vec(0u8..16, 0..300),
        n in 0usize..10,
    ) {
        let detector = detector(3, 1024);
        replay(&detector, &accesses);

        let top = detector.hotkeys(n);
        prop_assert!(top.len() <= n);
        for pair in top.windows(2) {
            prop_assert!(pair[0].count >= pair[1].count);
        }
        for hotkey in &top {
            prop_assert_eq!(hotkey.is_hot, hotkey.count > 3);
        }
    }
}

// ============================================================================
// Property 4: Breaker trips at the configured error percentage
// ============================================================================

/// Expected state after replaying `outcomes` (true = failure) through a
/// fresh breaker, ignoring time.
fn model_opens(outcomes: &[bool], volume_threshold: u64, pct: u8) -> bool {
    let (mut total, mut failed) = (0u64, 0u64);
    for &failure in outcomes {
        total += 1;
        if failure {
            failed += 1;
            let error_pct = failed as f64 * 100.0 / total as f64;
            if total >= volume_threshold && error_pct >= f64::from(pct) {
                return true;
            }
        }
    }
    false
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_breaker_trips_at_threshold(
        outcomes in prop::collection::vec(any::<bool>(), 0..60),
        volume_threshold in 1u64..20,
        pct in 1u8..=100,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new(BreakerConfig {
            request_timeout: Duration::from_secs(5),
            error_threshold_pct: pct,
            rolling_window: Duration::from_secs(600),
            rolling_buckets: 10,
            volume_threshold,
            reset_timeout: Duration::from_secs(600),
        });

        let rejected = runtime.block_on(async {
            let mut rejected = 0u64;
            for &failure in &outcomes {
                let result = breaker
                    .call(|| async move {
                        if failure {
                            Err(Error::Connection("refused".into()))
                        } else {
                            Ok(())
                        }
                    })
                    .await;
                if matches!(result, Err(Error::CircuitOpen)) {
                    rejected += 1;
                }
            }
            rejected
        });

        let opens = model_opens(&outcomes, volume_threshold, pct);
        let expected = if opens { CircuitState::Open } else { CircuitState::Closed };
        prop_assert_eq!(breaker.state(), expected);
        if !opens {
            prop_assert_eq!(rejected, 0);
        }
    }
}

// ============================================================================
// Property 5: SCAN patterns treat ids literally
// ============================================================================

proptest! {
    #[test]
    fn prop_patterns_match_own_index_keys(
        user in "[a-z0-9*?:%\\[\\]\\\\-]{1,12}",
        session in "[a-z0-9*?:%\\[\\]\\\\-]{1,12}",
        other in "[a-z0-9:-]{1,12}",
    ) {
        let keys = SessionKeys::new("session");
        let index = keys.index(&user, &session);

        prop_assert!(glob_match(&keys.session_pattern(&session), &index));
        prop_assert!(glob_match(&keys.user_pattern(&user), &index));
        prop_assert_eq!(keys.parse_index(&index), Some((user.clone(), session.clone())));

        if other != session {
            let unrelated = keys.index(&user, &other);
            prop_assert!(!glob_match(&keys.session_pattern(&session), &unrelated));
        }
        if other != user {
            let unrelated = keys.index(&other, &session);
            prop_assert!(!glob_match(&keys.user_pattern(&user), &unrelated));
        }
    }
}
