use super::*;

#[test]
fn default_status_is_disconnected_without_error() {
    let status = ConnectionStatus::default();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.last_error.is_none());
    assert!(!status.state.is_connected());
}

#[test]
fn default_policy_follows_schedule_then_repeats_last_delay() {
    let policy = RetryPolicy::default();
    let delays: Vec<_> = (0..8).map(|n| policy.delay_for(n).map(|d| d.as_millis())).collect();
    assert_eq!(
        delays,
        vec![Some(0), Some(2_000), Some(5_000), Some(10_000), Some(15_000), Some(30_000), Some(30_000), Some(30_000)]
    );
}

#[test]
fn policy_stops_at_attempt_cap() {
    let policy = RetryPolicy::new(vec![Duration::from_millis(1)], 3);
    assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1)));
    assert_eq!(policy.delay_for(3), None);
    assert_eq!(RetryPolicy::default().delay_for(10), None);
}

#[test]
fn empty_schedule_means_immediate_retries() {
    let policy = RetryPolicy::new(Vec::new(), 2);
    assert_eq!(policy.delay_for(0), Some(Duration::ZERO));
    assert_eq!(policy.delay_for(1), Some(Duration::ZERO));
}

#[test]
fn zero_cap_never_retries() {
    let policy = RetryPolicy::new(vec![Duration::from_secs(1)], 0);
    assert_eq!(policy.max_attempts(), 0);
    assert_eq!(policy.delay_for(0), None);
}
