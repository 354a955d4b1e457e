use super::*;
use crate::bus::channel::{ChannelBroker, DEFAULT_ADDRESS};

fn manager(broker: &ChannelBroker, urls: &[&str]) -> ConnectionManager {
    let config = ConnectionConfig {
        client_id: "lifecycle".to_string(),
        urls: urls.iter().map(|u| u.to_string()).collect(),
        ..Default::default()
    };
    ConnectionManager::new("test", config, Arc::new(broker.clone()))
}

#[tokio::test]
async fn test_connect_transitions_to_connected() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    conn.connect(&[]).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(broker.connected_clients(), 1);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);

    conn.connect(&[]).await.unwrap();
    conn.connect(&[]).await.unwrap();

    assert_eq!(broker.connected_clients(), 1);
}

#[tokio::test]
async fn test_first_reachable_url_wins() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &["memory://down", DEFAULT_ADDRESS]);

    conn.connect(&[]).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_failure_reports_every_endpoint() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &["memory://a", "memory://b"]);

    let err = conn.connect(&[]).await.unwrap_err();

    match err {
        BusError::Connection(msg) => {
            assert!(msg.contains("memory://a"));
            assert!(msg.contains("memory://b"));
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_subscribe_leaves_disconnected() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);

    let result = conn.connect(&["bad/#/filter".to_string()]).await;

    assert!(matches!(result, Err(BusError::Subscribe(_))));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connected_clients(), 0);
    assert!(matches!(conn.link().await, Err(BusError::NotConnected)));
}

#[tokio::test]
async fn test_connection_loss_sets_disconnected() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);
    conn.connect(&[]).await.unwrap();
    let mut state = conn.watch_state();

    broker.drop_connections();

    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .expect("state never became disconnected")
    .unwrap();
    assert!(matches!(conn.link().await, Err(BusError::NotConnected)));

    // No automatic reconnect, but an explicit one works.
    conn.connect(&[]).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_close_before_connect_is_clean() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);

    conn.close_async();
    conn.close_async();

    conn.wait_for_close(Duration::from_secs(1)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_disconnects_broker() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);
    conn.connect(&[]).await.unwrap();

    conn.close_async();
    assert!(matches!(
        conn.state(),
        ConnectionState::Closing | ConnectionState::Closed
    ));
    conn.wait_for_close(Duration::from_secs(1)).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(broker.connected_clients(), 0);
}

#[tokio::test]
async fn test_connect_after_close_fails() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);
    conn.close_async();

    assert!(matches!(conn.connect(&[]).await, Err(BusError::Closed)));
}

#[tokio::test]
async fn test_wait_for_close_times_out_without_close() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);
    conn.connect(&[]).await.unwrap();

    let result = conn.wait_for_close(Duration::from_millis(20)).await;

    assert!(matches!(result, Err(BusError::Timeout(_))));
}

#[tokio::test]
async fn test_guard_resolves_on_close() {
    let broker = ChannelBroker::new();
    let conn = Arc::new(manager(&broker, &[DEFAULT_ADDRESS]));
    conn.connect(&[]).await.unwrap();

    let guarded = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            conn.guard(ConnectionState::Connected, futures::future::pending::<Result<()>>())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    conn.close_async();

    let result = tokio::time::timeout(Duration::from_secs(1), guarded)
        .await
        .expect("guard never resolved")
        .unwrap();
    assert!(matches!(result, Err(BusError::Closed)));
}

#[test]
fn test_close_without_runtime() {
    let broker = ChannelBroker::new();
    let conn = manager(&broker, &[DEFAULT_ADDRESS]);

    conn.close_async();

    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn test_unusable_error_mapping() {
    assert!(matches!(
        ConnectionState::Disconnected.unusable_error(),
        BusError::NotConnected
    ));
    assert!(matches!(
        ConnectionState::Connecting.unusable_error(),
        BusError::NotConnected
    ));
    assert!(matches!(ConnectionState::Closing.unusable_error(), BusError::Closed));
    assert!(matches!(ConnectionState::Closed.unusable_error(), BusError::Closed));
}
