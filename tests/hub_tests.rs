//! Orchestrator lifecycle tests against the fake container driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::FakeDriver;
use threecompute_backend::auth::Principal;
use threecompute_backend::terminal::{ClientHandle, ClientId, Hub};

fn principal(user_id: &str, port_start: u16) -> Principal {
    Principal {
        user_id: user_id.to_string(),
        email: format!("{user_id}@example.com"),
        port_start,
    }
}

async fn start_hub(driver: Arc<FakeDriver>) -> Arc<Hub> {
    let (hub, channels) = Hub::new(driver);
    tokio::spawn(hub.clone().run(channels));
    // Let the reducer finish startup discovery before tests drive it.
    settle().await;
    hub
}

/// Give queued reducer events and freshly spawned tasks a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn connect(
    hub: &Arc<Hub>,
    user_id: &str,
    port_start: u16,
    tab_id: &str,
) -> (ClientId, mpsc::Receiver<Vec<u8>>) {
    let (sender, receiver) = mpsc::channel(256);
    let client_id = hub
        .register(ClientHandle {
            principal: principal(user_id, port_start),
            tab_id: tab_id.to_string(),
            sender,
        })
        .await;
    (client_id, receiver)
}

#[tokio::test]
async fn fresh_user_spawns_one_container() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    connect(&hub, "U1", 8000, "1").await;

    {
        let state = driver.state();
        assert_eq!(state.spawn_calls.len(), 1);
        let (user, name, ports) = &state.spawn_calls[0];
        assert_eq!(user, "U1");
        assert_eq!(name, "user-container-U1");
        assert_eq!(ports.start, 8000);
        assert_eq!(ports.end, 8009);
    }
    assert_eq!(
        hub.container_for_user("U1").await.as_deref(),
        Some("user-container-U1")
    );
    assert_eq!(hub.session_count().await, 1);
}

#[tokio::test]
async fn second_tab_reuses_the_container() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    connect(&hub, "U1", 8000, "1").await;
    connect(&hub, "U1", 8000, "2").await;

    assert_eq!(driver.state().spawn_calls.len(), 1);
    assert_eq!(hub.session_count().await, 2);
}

#[tokio::test]
async fn concurrent_registers_create_one_container() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let mut registrations = Vec::new();
    for tab in 0..8 {
        let hub = hub.clone();
        registrations.push(tokio::spawn(async move {
            let (sender, _receiver) = mpsc::channel(256);
            hub.register(ClientHandle {
                principal: principal("U1", 8000),
                tab_id: tab.to_string(),
                sender,
            })
            .await
        }));
    }
    for registration in registrations {
        registration.await.unwrap();
    }

    assert_eq!(driver.state().spawn_calls.len(), 1);
    assert_eq!(hub.session_count().await, 8);
}

#[tokio::test]
async fn stopped_container_is_restarted_not_respawned() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", false);
    let hub = start_hub(driver.clone()).await;

    connect(&hub, "U1", 8000, "1").await;

    let state = driver.state();
    assert_eq!(state.start_calls, vec!["user-container-U1"]);
    assert!(state.spawn_calls.is_empty());
}

#[tokio::test]
async fn failed_restart_removes_and_respawns() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", false);
    driver.state().fail_start = true;
    let hub = start_hub(driver.clone()).await;

    connect(&hub, "U1", 8000, "1").await;

    let state = driver.state();
    assert!(!state.start_calls.is_empty());
    assert_eq!(state.remove_calls, vec!["user-container-U1"]);
    assert_eq!(state.spawn_calls.len(), 1);
}

#[tokio::test]
async fn timer_never_coexists_with_sessions() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (first, _rx1) = connect(&hub, "U1", 8000, "1").await;
    let (second, _rx2) = connect(&hub, "U1", 8000, "2").await;
    assert!(!hub.has_cleanup_timer("U1").await);

    hub.unregister(first).await;
    settle().await;
    assert!(!hub.has_cleanup_timer("U1").await);
    assert_eq!(hub.session_count().await, 1);

    hub.unregister(second).await;
    settle().await;
    assert!(hub.has_cleanup_timer("U1").await);
    assert_eq!(hub.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_container_is_reaped_after_poll() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _rx) = connect(&hub, "U1", 8000, "1").await;
    hub.unregister(client).await;
    settle().await;
    assert!(hub.has_cleanup_timer("U1").await);

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(driver.state().remove_calls, vec!["user-container-U1"]);
    assert!(hub.container_for_user("U1").await.is_none());
    assert!(!hub.has_cleanup_timer("U1").await);
}

#[tokio::test(start_paused = true)]
async fn container_with_user_processes_is_not_reaped() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _rx) = connect(&hub, "U1", 8000, "1").await;
    driver
        .state()
        .processes
        .insert("user-container-U1".to_string(), vec!["python3 main.py".to_string()]);
    hub.unregister(client).await;
    settle().await;

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(driver.state().remove_calls.is_empty());
    assert!(hub.container_for_user("U1").await.is_some());
    // Still polling for the processes to finish.
    assert!(hub.has_cleanup_timer("U1").await);
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_poll_window_cancels_reaper() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _rx) = connect(&hub, "U1", 8000, "1").await;
    hub.unregister(client).await;
    settle().await;
    assert!(hub.has_cleanup_timer("U1").await);

    // Reconnect before the first poll fires.
    tokio::time::sleep(Duration::from_secs(3)).await;
    connect(&hub, "U1", 8000, "1").await;
    assert!(!hub.has_cleanup_timer("U1").await);

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(driver.state().remove_calls.is_empty());
    assert!(hub.container_for_user("U1").await.is_some());
    // No new container was created for the reconnect.
    assert_eq!(driver.state().spawn_calls.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn engine_failure_rearms_the_poll() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _rx) = connect(&hub, "U1", 8000, "1").await;
    driver.state().fail_top = true;
    hub.unregister(client).await;
    settle().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(driver.state().remove_calls.is_empty());
    assert!(hub.has_cleanup_timer("U1").await);

    // Once the engine recovers, the next poll removes the idle container.
    driver.state().fail_top = false;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(driver.state().remove_calls, vec!["user-container-U1"]);
}

#[tokio::test(start_paused = true)]
async fn discovered_orphan_container_is_reaped() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-ghost", true);
    let hub = start_hub(driver.clone()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(hub.container_for_user("ghost").await.is_some());
    assert!(hub.has_cleanup_timer("ghost").await);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(driver.state().remove_calls, vec!["user-container-ghost"]);
    assert!(hub.container_for_user("ghost").await.is_none());
}

#[tokio::test]
async fn shutdown_closes_client_queues() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (_client, mut receiver) = connect(&hub, "U1", 8000, "1").await;
    hub.stop();

    let closed = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("queue should close on shutdown");
    assert!(closed.is_none());
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (_first, mut rx1) = connect(&hub, "U1", 8000, "1").await;
    let (_second, mut rx2) = connect(&hub, "U2", 8010, "1").await;

    hub.broadcast(b"announcement".to_vec()).await;
    settle().await;

    assert_eq!(rx1.try_recv().unwrap(), b"announcement".to_vec());
    assert_eq!(rx2.try_recv().unwrap(), b"announcement".to_vec());
}

#[tokio::test]
async fn input_without_attach_is_an_error() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _rx) = connect(&hub, "U1", 8000, "1").await;
    let result = hub.handle_pty_input(client, "echo hi\n").await;
    assert!(result.is_err());
}
