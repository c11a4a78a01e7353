//! Connection lifecycle tests against a scripted conductor

mod common;

use common::{elohim_app, lamad_cell, manager, no_reconnect, MockConductor, Step, AGENT};
use elohim_connect::call::{CallErrorKind, ZomeCall, ZomeCaller};
use elohim_connect::conductor::backend::AppInterfaceInfo;
use elohim_connect::config::{ConnectionConfig, ReconnectConfig};
use elohim_connect::{ConnectError, ConnectOverrides, ConnectionPhase, ConnectionState};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        base_delay_ms: 100,
        max_delay_ms: 1000,
        max_attempts,
        jitter: 0.0,
    }
}

#[tokio::test]
async fn test_connect_populates_session() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    manager.connect().await.unwrap();

    let state = manager.state();
    assert_eq!(state.phase, ConnectionPhase::Connected);
    assert!(manager.is_connected());
    assert_eq!(state.agent_pub_key.as_deref(), Some(&AGENT[..]));
    assert_eq!(state.cells_by_role.get("lamad"), Some(&lamad_cell()));
    assert_eq!(state.roles(), vec!["imagodei".to_string(), "lamad".to_string()]);
    assert_eq!(state.admin_channel.unwrap().url, "ws://localhost:4444");
    assert_eq!(state.app_channel.unwrap().url, "ws://localhost:4445");
    assert!(state.connected_at.is_some());
    assert!(state.last_error.is_none());

    assert_eq!(
        conductor.logged("grant"),
        vec!["grant elohim-connect-imagodei", "grant elohim-connect-lamad"]
    );
    assert_eq!(conductor.logged("attach"), vec!["attach 0"]);
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();

    assert_eq!(conductor.admin_opens(), 1);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_failure_at_any_step_leaves_error_state() {
    let steps = [
        Step::OpenAdmin,
        Step::ListApps,
        Step::Grant,
        Step::ListInterfaces,
        Step::Attach,
        Step::IssueToken,
        Step::OpenApp,
    ];

    for step in steps {
        let conductor = MockConductor::new();
        conductor.fail_at(Some(step));
        let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

        let result = manager.connect().await;
        assert!(result.is_err(), "{:?} should fail the connect", step);

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Error, "{:?}", step);
        assert!(state.admin_channel.is_none(), "{:?}", step);
        assert!(state.app_channel.is_none(), "{:?}", step);
        assert!(state.agent_pub_key.is_none(), "{:?}", step);
        assert!(state.cells_by_role.is_empty(), "{:?}", step);
        assert!(state.last_error.unwrap().contains("scripted failure"), "{:?}", step);
        assert!(!manager.is_connected());

        if step != Step::OpenAdmin {
            assert!(conductor.log().contains(&"close_admin".to_string()), "{:?}", step);
        }
    }
}

#[tokio::test]
async fn test_connect_recovers_after_error() {
    let conductor = MockConductor::new();
    conductor.fail_at(Some(Step::IssueToken));
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    assert!(manager.connect().await.is_err());
    conductor.fail_at(None);
    manager.connect().await.unwrap();

    assert!(manager.is_connected());
    assert!(manager.state().last_error.is_none());
}

#[tokio::test]
async fn test_missing_required_role() {
    let conductor = MockConductor::new();
    let config = ConnectionConfig {
        required_roles: vec!["lamad".into(), "hylo".into()],
        ..Default::default()
    };
    let manager = manager(&conductor, config, no_reconnect());

    let err = manager.connect().await.unwrap_err();
    match err {
        ConnectError::NoCellForRole { role, available } => {
            assert_eq!(role, "hylo");
            assert_eq!(available, vec!["imagodei".to_string(), "lamad".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(manager.phase(), ConnectionPhase::Error);
    assert!(conductor.logged("grant").is_empty());
}

#[tokio::test]
async fn test_app_without_cells_is_an_error() {
    let mut empty = elohim_app();
    empty.cells.values_mut().for_each(Vec::clear);
    let conductor = MockConductor::new().with_apps(vec![empty]);
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    assert!(manager.connect().await.is_err());
    assert_eq!(manager.phase(), ConnectionPhase::Error);
}

#[tokio::test]
async fn test_installs_missing_app_from_bundle() {
    let conductor = MockConductor::uninstalled(elohim_app());
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Config(_)));

    manager
        .connect_with(ConnectOverrides {
            happ_bundle_path: Some("/opt/elohim/elohim.happ".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(manager.is_connected());
    let log = conductor.log();
    assert!(log.contains(&"generate_agent_pub_key".to_string()));
    assert!(log.contains(&"install_app elohim /opt/elohim/elohim.happ".to_string()));
    assert!(log.contains(&"enable_app elohim".to_string()));
}

#[tokio::test]
async fn test_reuses_existing_app_interface() {
    let conductor = MockConductor::new().with_interfaces(vec![
        AppInterfaceInfo {
            port: 4461,
            installed_app_id: Some("other".into()),
        },
        AppInterfaceInfo {
            port: 4460,
            installed_app_id: None,
        },
    ]);
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    manager.connect().await.unwrap();

    assert!(conductor.logged("attach").is_empty());
    assert_eq!(manager.state().app_channel.unwrap().url, "ws://localhost:4460");
}

#[tokio::test]
async fn test_preferred_port_is_attached_when_not_listed() {
    let conductor = MockConductor::new().with_interfaces(vec![AppInterfaceInfo {
        port: 4460,
        installed_app_id: None,
    }]);
    let config = ConnectionConfig {
        app_port: 4470,
        ..Default::default()
    };
    let manager = manager(&conductor, config, no_reconnect());

    manager.connect().await.unwrap();

    assert_eq!(conductor.logged("attach"), vec!["attach 4470"]);
    assert_eq!(manager.state().app_channel.unwrap().url, "ws://localhost:4470");
}

#[tokio::test]
async fn test_call_routes_by_role() {
    let conductor = MockConductor::new();
    conductor.respond("get_agent", json!({"name": "Ada"}));
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());
    manager.connect().await.unwrap();

    let echoed = manager
        .call("lamad", "content_store", "get_content", &json!({"id": "manifesto"}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"id": "manifesto"}));

    let agent = manager
        .call("imagodei", "imagodei", "get_agent", &json!(null))
        .await
        .unwrap();
    assert_eq!(agent, json!({"name": "Ada"}));

    assert_eq!(
        conductor.logged("call"),
        vec!["call 1 content_store.get_content", "call 2 imagodei.get_agent"]
    );

    let err = manager
        .call("hylo", "hylo", "get", &json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::NoCellForRole { .. }));
}

#[tokio::test]
async fn test_call_without_session_is_not_connected() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    let err = manager
        .call("lamad", "content_store", "get_content", &json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::NotConnected));

    let caller: Arc<dyn ZomeCaller> = manager;
    let outcome = caller
        .call(&ZomeCall::new("lamad", "content_store", "get_content", json!(null)))
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(CallErrorKind::NotConnected));
    assert!(!caller.is_connected());
}

#[tokio::test]
async fn test_zome_error_keeps_session() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), fast_reconnect(3));
    manager.connect().await.unwrap();

    conductor.fail_calls(Some(ConnectError::Zome("Entry failed validation".into())));
    let err = manager
        .call("lamad", "content_store", "create_content", &json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::Zome(_)));
    assert!(manager.is_connected());
    assert_eq!(conductor.admin_opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_early_call_waits_for_connect() {
    let conductor = MockConductor::new();
    conductor.delay_admin_open(Duration::from_millis(200));
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    let connecting = Arc::clone(&manager);
    let connect = tokio::spawn(async move { connecting.connect().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.phase(), ConnectionPhase::Connecting);

    let result = manager
        .call("lamad", "content_store", "get_content", &json!({"id": "a"}))
        .await
        .unwrap();

    assert_eq!(result, json!({"id": "a"}));
    connect.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_triggers_reconnect() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), fast_reconnect(3));
    manager.connect().await.unwrap();

    conductor.fail_calls(Some(ConnectError::Transport("socket is closed".into())));
    let err = manager
        .call("lamad", "content_store", "get_content", &json!(null))
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(!manager.is_connected());

    conductor.fail_calls(None);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(manager.is_connected());
    assert_eq!(conductor.admin_opens(), 2);
    assert_eq!(manager.state().reconnect_attempt, 0);
    assert!(conductor.log().contains(&"close_app".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_channel_close_walks_reconnect_phases() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), fast_reconnect(3));
    manager.connect().await.unwrap();

    let phases = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&phases);
    let id = manager.on_state_change(move |s: &ConnectionState| {
        let mut seen = seen.lock().unwrap();
        if seen.last() != Some(&s.phase) {
            seen.push(s.phase);
        }
    });

    conductor.drop_app_channel();
    tokio::time::sleep(Duration::from_secs(5)).await;
    manager.remove_state_listener(id);

    assert!(manager.is_connected());
    assert_eq!(
        *phases.lock().unwrap(),
        vec![
            ConnectionPhase::Error,
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Authenticating,
            ConnectionPhase::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), fast_reconnect(2));
    manager.connect().await.unwrap();

    conductor.fail_admin_opens(10);
    conductor.drop_app_channel();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let state = manager.state();
    assert_eq!(state.phase, ConnectionPhase::Error);
    assert_eq!(state.reconnect_attempt, 2);
    assert!(state.last_error.is_some());
    assert_eq!(conductor.admin_opens(), 3);

    // A manual connect still works once the conductor is back
    conductor.fail_admin_opens(0);
    manager.connect().await.unwrap();
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_resets_and_stops_reconnect() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), fast_reconnect(5));
    let mut connectivity = manager.connectivity();

    manager.connect().await.unwrap();
    assert!(*connectivity.borrow_and_update());

    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::default());
    assert!(!*connectivity.borrow_and_update());
    let log = conductor.log();
    assert!(log.contains(&"close_app".to_string()));
    assert!(log.contains(&"close_admin".to_string()));

    // The stale monitor must not bring the session back
    conductor.drop_app_channel();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    assert_eq!(conductor.admin_opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_connection() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    assert!(!manager.wait_for_connection(Duration::from_secs(1)).await);

    let connecting = Arc::clone(&manager);
    let connect = tokio::spawn(async move { connecting.connect().await });
    assert!(manager.wait_for_connection(Duration::from_secs(5)).await);
    connect.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_connection_ends_on_error() {
    let conductor = MockConductor::new();
    conductor.fail_at(Some(Step::Grant));
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());

    let connecting = Arc::clone(&manager);
    let connect = tokio::spawn(async move { connecting.connect().await });
    assert!(!manager.wait_for_connection(Duration::from_secs(5)).await);
    assert!(connect.await.unwrap().is_err());
}

#[tokio::test]
async fn test_display_info() {
    let conductor = MockConductor::new();
    let manager = manager(&conductor, ConnectionConfig::default(), no_reconnect());
    manager.connect().await.unwrap();

    let info = manager.display_info();
    assert_eq!(info.phase, ConnectionPhase::Connected);
    assert_eq!(info.admin_url.as_deref(), Some("ws://localhost:4444"));
    assert_eq!(info.cells.len(), 2);
    assert!(info.agent_pub_key.unwrap().starts_with('u'));
}
