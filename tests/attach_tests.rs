//! Attach-path tests: lazy attach on first resize, input forwarding through
//! a real PTY, and PTY teardown on unregister. The fake driver hands out a
//! local `cat` process in place of the in-container multiplexer attach.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::FakeDriver;
use threecompute_backend::auth::Principal;
use threecompute_backend::terminal::{ClientHandle, ClientId, Hub};

fn principal(user_id: &str) -> Principal {
    Principal {
        user_id: user_id.to_string(),
        email: format!("{user_id}@example.com"),
        port_start: 8000,
    }
}

async fn start_hub(driver: Arc<FakeDriver>) -> Arc<Hub> {
    let (hub, channels) = Hub::new(driver);
    tokio::spawn(hub.clone().run(channels));
    tokio::time::sleep(Duration::from_millis(10)).await;
    hub
}

async fn connect(hub: &Arc<Hub>, user_id: &str, tab_id: &str) -> (ClientId, mpsc::Receiver<Vec<u8>>) {
    let (sender, receiver) = mpsc::channel(256);
    let client_id = hub
        .register(ClientHandle {
            principal: principal(user_id),
            tab_id: tab_id.to_string(),
            sender,
        })
        .await;
    (client_id, receiver)
}

/// Collect forwarded output frames until `needle` shows up or the deadline
/// passes.
async fn wait_for_output(receiver: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !collected.contains(needle) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = match tokio::time::timeout(remaining, receiver.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        // A coalesced write may carry several newline-separated frames.
        let text = String::from_utf8_lossy(&frame);
        for part in text.split('\n') {
            if part.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(part) {
                assert_eq!(value["type"], "pty-output");
                if let Some(output) = value["data"]["output"].as_str() {
                    collected.push_str(output);
                }
            }
        }
    }
    collected
}

#[tokio::test]
async fn first_resize_attaches_and_forwards_io() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", true);
    let hub = start_hub(driver.clone()).await;

    let (client, mut receiver) = connect(&hub, "U1", "1").await;
    assert_eq!(hub.session_attached(client).await, Some(false));

    hub.handle_resize(client, 24, 80).await.unwrap();
    assert_eq!(hub.session_attached(client).await, Some(true));
    {
        let state = driver.state();
        assert_eq!(
            state.attach_calls,
            vec![("user-container-U1".to_string(), "1".to_string())]
        );
    }

    hub.handle_pty_input(client, "echo hi\n").await.unwrap();
    let output = wait_for_output(&mut receiver, "echo hi").await;
    assert!(output.contains("echo hi"), "output was: {output:?}");

    hub.unregister(client).await;
}

#[tokio::test]
async fn repeated_resizes_attach_only_once() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", true);
    let hub = start_hub(driver.clone()).await;

    let (client, _receiver) = connect(&hub, "U1", "1").await;
    hub.handle_resize(client, 24, 80).await.unwrap();
    hub.handle_resize(client, 30, 100).await.unwrap();
    hub.handle_resize(client, 50, 132).await.unwrap();

    assert_eq!(driver.state().attach_calls.len(), 1);
    hub.unregister(client).await;
}

#[tokio::test]
async fn tabs_attach_to_distinct_multiplexer_sessions() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", true);
    let hub = start_hub(driver.clone()).await;

    let (first, _rx1) = connect(&hub, "U1", "1").await;
    let (second, _rx2) = connect(&hub, "U1", "2").await;

    hub.handle_resize(first, 24, 80).await.unwrap();
    hub.handle_resize(second, 24, 80).await.unwrap();

    let state = driver.state();
    assert_eq!(
        state.attach_calls,
        vec![
            ("user-container-U1".to_string(), "1".to_string()),
            ("user-container-U1".to_string(), "2".to_string()),
        ]
    );
    drop(state);

    hub.unregister(first).await;
    hub.unregister(second).await;
}

#[tokio::test]
async fn unregister_tears_down_the_forwarder() {
    let driver = FakeDriver::new();
    driver.add_container("user-container-U1", true);
    let hub = start_hub(driver.clone()).await;

    let (client, mut receiver) = connect(&hub, "U1", "1").await;
    hub.handle_resize(client, 24, 80).await.unwrap();

    hub.unregister(client).await;

    // The reducer closed the PTY; the forwarder observes EOF and drops its
    // queue sender, so the receiver eventually reports closure.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, receiver.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => panic!("send queue was not closed after unregister"),
        }
    }
    assert_eq!(hub.session_attached(client).await, None);
}

#[tokio::test]
async fn attach_restarts_a_stopped_container() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _receiver) = connect(&hub, "U1", "1").await;
    // The container dies between register and the first resize.
    {
        let mut state = driver.state();
        state.running.remove("user-container-U1");
    }

    hub.handle_resize(client, 24, 80).await.unwrap();

    let state = driver.state();
    assert!(state.start_calls.contains(&"user-container-U1".to_string()));
    assert_eq!(state.attach_calls.len(), 1);
    drop(state);

    hub.unregister(client).await;
}

#[tokio::test]
async fn resize_without_session_fails() {
    let driver = FakeDriver::new();
    let hub = start_hub(driver.clone()).await;

    let (client, _receiver) = connect(&hub, "U1", "1").await;
    hub.unregister(client).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(hub.handle_resize(client, 24, 80).await.is_err());
}
