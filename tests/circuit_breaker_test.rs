//! Circuit breaker routing tests

mod common;

use common::{manager, no_reconnect, MockConductor, ScriptedCaller};
use elohim_connect::call::{CallErrorKind, ZomeCall, ZomeCaller};
use elohim_connect::config::{CircuitBreakerSection, Config, ConnectionConfig};
use elohim_connect::{
    BreakerCaller, CircuitBreaker, CircuitConfig, CircuitOverrides, CircuitState, ConnectError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(CircuitConfig {
        failure_threshold: 3,
        failure_window: Duration::from_secs(10),
        reset_timeout: Duration::from_secs(5),
        success_threshold: 2,
    }))
}

fn content_call(fn_name: &str) -> ZomeCall {
    ZomeCall::new("lamad", "content_store", fn_name, json!({"id": "manifesto"}))
}

#[test]
fn test_config_section_defaults() {
    let config = CircuitConfig::from(&Config::default().circuit_breaker);
    assert_eq!(config, CircuitConfig::default());

    let clamped = CircuitConfig::from(&CircuitBreakerSection {
        failure_threshold: 0,
        success_threshold: 0,
        ..Default::default()
    });
    assert_eq!(clamped.failure_threshold, 1);
    assert_eq!(clamped.success_threshold, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_the_call() {
    let caller = ScriptedCaller::new(true);
    caller.fail_always("get_content");
    let breaker = breaker();
    let routed = BreakerCaller::new(caller.clone(), Arc::clone(&breaker));

    for _ in 0..3 {
        let outcome = routed.call(&content_call("get_content")).await;
        assert_eq!(outcome.error_kind, Some(CallErrorKind::Zome));
    }
    assert_eq!(breaker.get_state("lamad.content_store"), Some(CircuitState::Open));

    let outcome = routed.call(&content_call("get_content")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(CallErrorKind::CircuitOpen));
    assert_eq!(
        outcome.error.as_deref(),
        Some("Circuit 'lamad.content_store' is open")
    );
    assert_eq!(caller.count("get_content"), 3);

    // Other zomes have their own circuit
    let other = routed
        .call(&ZomeCall::new("imagodei", "imagodei", "get_agent", json!(null)))
        .await;
    assert!(other.success);
}

#[tokio::test(start_paused = true)]
async fn test_trial_calls_close_the_circuit() {
    let caller = ScriptedCaller::new(true);
    caller.fail_times("get_content", 3);
    let breaker = breaker();
    let routed = BreakerCaller::new(caller.clone(), Arc::clone(&breaker));

    for _ in 0..3 {
        routed.call(&content_call("get_content")).await;
    }
    tokio::time::advance(Duration::from_secs(5)).await;

    let first = routed.call(&content_call("get_content")).await;
    assert!(first.success);
    assert_eq!(first.data, Some(json!({"id": "manifesto"})));
    assert_eq!(breaker.get_state("lamad.content_store"), Some(CircuitState::HalfOpen));

    routed.call(&content_call("get_content")).await;
    assert_eq!(breaker.get_state("lamad.content_store"), Some(CircuitState::Closed));
    assert_eq!(caller.count("get_content"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let caller = ScriptedCaller::new(true);
    caller.fail_always("get_content");
    let breaker = breaker();
    let routed = BreakerCaller::new(caller.clone(), Arc::clone(&breaker));

    for _ in 0..3 {
        routed.call(&content_call("get_content")).await;
    }
    tokio::time::advance(Duration::from_secs(5)).await;

    let trial = routed.call(&content_call("get_content")).await;
    assert_eq!(trial.error_kind, Some(CallErrorKind::Zome));
    assert_eq!(breaker.get_state("lamad.content_store"), Some(CircuitState::Open));

    let blocked = routed.call(&content_call("get_content")).await;
    assert_eq!(blocked.error_kind, Some(CallErrorKind::CircuitOpen));
    assert_eq!(caller.count("get_content"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_reset_lets_calls_through() {
    let caller = ScriptedCaller::new(true);
    caller.fail_times("get_content", 3);
    let breaker = breaker();
    let routed = BreakerCaller::new(caller.clone(), Arc::clone(&breaker));

    for _ in 0..3 {
        routed.call(&content_call("get_content")).await;
    }
    routed.breaker().reset("lamad.content_store");

    let outcome = routed.call(&content_call("get_content")).await;
    assert!(outcome.success);
    let stats = breaker.get_stats("lamad.content_store").unwrap();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.recent_failures, 0);
}

#[tokio::test]
async fn test_execute_reports_failure_payload() {
    let breaker = CircuitBreaker::default();
    let result = breaker
        .execute_with(
            "doorway.health",
            Some(&CircuitOverrides {
                failure_threshold: Some(1),
                ..Default::default()
            }),
            || async { Err::<(), _>(ConnectError::Timeout("health".into())) },
        )
        .await;

    assert!(!result.success);
    assert!(!result.circuit_open);
    assert_eq!(result.state, CircuitState::Open);
    assert_eq!(result.error_message().as_deref(), Some("Request timeout: health"));
}

#[tokio::test]
async fn test_breaker_over_connection_manager() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());
    let routed = BreakerCaller::new(manager.clone(), breaker());

    // Not connected yet: failures count against the circuit
    for _ in 0..3 {
        let outcome = routed.call(&content_call("get_content")).await;
        assert_eq!(outcome.error_kind, Some(CallErrorKind::NotConnected));
    }
    manager.connect().await.unwrap();
    assert!(routed.is_connected());

    let blocked = routed.call(&content_call("get_content")).await;
    assert_eq!(blocked.error_kind, Some(CallErrorKind::CircuitOpen));
    assert!(conductor.logged("call").is_empty());

    routed.breaker().reset("lamad.content_store");
    let outcome = routed.call(&content_call("get_content")).await;
    assert_eq!(outcome.data, Some(json!({"id": "manifesto"})));
}
