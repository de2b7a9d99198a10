use duet::hardening::*;
use duet::types::*;
use std::time::Duration;

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_retries,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter: 0.0,
        ..RetryConfig::default()
    })
}

/// Feeds the same failure to the policy until it gives up and returns the
/// number of attempts made and the delays it asked for.
fn simulate(policy: &RetryPolicy, err: &TransportError) -> (u32, Vec<Duration>, GiveUpReason) {
    let mut attempt = 0;
    let mut delays = Vec::new();
    loop {
        match policy.decide(err, attempt, false) {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                assert_eq!(next_attempt, attempt + 1);
                delays.push(delay);
                attempt = next_attempt;
            }
            RetryDecision::GiveUp(reason) => return (attempt + 1, delays, reason),
        }
    }
}

#[test]
fn test_attempts_never_exceed_max_retries_plus_one() {
    let err = TransportError::new(Some(503), "unavailable");
    for max_retries in [0, 1, 3, 7] {
        let (attempts, delays, reason) = simulate(&policy(max_retries), &err);
        assert_eq!(attempts, max_retries + 1);
        assert_eq!(delays.len() as u32, max_retries);
        assert_eq!(reason, GiveUpReason::Exhausted);
    }
}

#[test]
fn test_backoff_sequence_is_capped() {
    let err = TransportError::network("connection reset");
    let (_, delays, _) = simulate(&policy(6), &err);
    let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![100, 200, 400, 800, 1_000, 1_000]);
}

#[test]
fn test_non_retryable_status_gives_up_immediately() {
    for status in [400, 401, 403, 404, 422] {
        let err = TransportError::new(Some(status), "client error");
        let (attempts, delays, reason) = simulate(&policy(3), &err);
        assert_eq!(attempts, 1, "status {}", status);
        assert!(delays.is_empty());
        assert_eq!(reason, GiveUpReason::NotRetryable);
    }
}

#[test]
fn test_statusless_failures_are_retryable() {
    let policy = policy(3);
    assert!(policy.is_retryable(None));
    assert!(policy.is_retryable(Some(0)));
    let err = TransportError::timeout(Duration::from_secs(30));
    assert!(matches!(policy.decide(&err, 0, false), RetryDecision::Retry { .. }));
}

#[test]
fn test_received_data_wins_over_everything() {
    let policy = policy(3);
    let err = TransportError::new(Some(502), "bad gateway");
    assert_eq!(
        policy.decide(&err, 0, true),
        RetryDecision::GiveUp(GiveUpReason::DataReceived)
    );
    assert_eq!(
        policy.decide(&err, 99, true),
        RetryDecision::GiveUp(GiveUpReason::DataReceived)
    );
}

#[test]
fn test_config_fills_missing_fields_with_defaults() {
    let config: RetryConfig = match serde_json::from_str(r#"{"max_retries": 5, "jitter": 0.0}"#) {
        Ok(c) => c,
        Err(e) => panic!("Failed to parse retry config: {}", e),
    };
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.base_delay_ms, RetryConfig::default().base_delay_ms);
    assert!(config.retryable_statuses.contains(&503));

    let policy = RetryPolicy::new(config);
    assert_eq!(policy.max_retries(), 5);
    assert_eq!(policy.connection_timeout(), Duration::from_millis(30_000));
}

#[test]
fn test_custom_retryable_statuses() {
    let policy = RetryPolicy::new(RetryConfig {
        retryable_statuses: vec![418],
        jitter: 0.0,
        ..RetryConfig::default()
    });
    assert!(policy.is_retryable(Some(418)));
    assert!(!policy.is_retryable(Some(503)));
}
