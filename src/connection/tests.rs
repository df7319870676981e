//! Connection lifecycle tests over the loopback transport

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::codec::WatcherCommand;
use crate::test_utils::{FakeDevice, PROJECT_NAME, SAMPLE_RATE};
use crate::types::{ConnectionMode, TimestampMode, VarType, VariableDescriptor};
use crate::{ConnectionErrorKind, LinkConfig, WatcherError};

fn vars() -> Vec<VariableDescriptor> {
    vec![
        VariableDescriptor::new("myvar", VarType::Float64, TimestampMode::Dense),
        VariableDescriptor::new("counter", VarType::Int32, TimestampMode::Sparse),
    ]
}

fn kind(err: &WatcherError) -> Option<ConnectionErrorKind> {
    match err {
        WatcherError::Connection { kind, .. } => Some(*kind),
        _ => None,
    }
}

const EMPTY_LIST: &str = r#"{"watcher":{"sampleRate":48000,"timestamp":0,"watchers":[]}}"#;

/// A device that greets with `hello` and answers every control message with
/// an empty list, until `hangup` is cancelled.
fn scripted(
    config: &LinkConfig,
    hello: WireMessage,
    hangup: CancellationToken,
) -> Arc<LoopbackConnector> {
    let (connector, mut peers) = loopback();
    let control_add = config.control_add.clone();
    tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            let LoopbackPeer { url, tx, mut rx } = peer;
            let (hello, hangup) = (hello.clone(), hangup.clone());
            let control = url.ends_with(&control_add);
            tokio::spawn(async move {
                if control {
                    let _ = tx.send(hello);
                }
                loop {
                    tokio::select! {
                        _ = hangup.cancelled() => break,
                        message = rx.recv() => match message {
                            Some(WireMessage::Text(_)) if control => {
                                let _ = tx.send(WireMessage::Text(EMPTY_LIST.into()));
                            }
                            Some(_) => {}
                            None => break,
                        },
                    }
                }
            });
        }
    });
    Arc::new(connector)
}

fn quick_config() -> LinkConfig {
    LinkConfig {
        ip: "bela.test".into(),
        connect_timeout_ms: 100,
        response_timeout_ms: 100,
        ..LinkConfig::default()
    }
}

#[tokio::test]
async fn handshake_loads_the_variable_list() {
    let _ = tracing_subscriber::fmt::try_init();
    let device = FakeDevice::new(vars());
    let conn = device.connection(ConnectionMode::Stream);
    assert!(!conn.is_connected());
    assert_eq!(conn.project_name(), None);

    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.project_name().as_deref(), Some(PROJECT_NAME));
    assert_eq!(conn.sample_rate(), SAMPLE_RATE);
    let names: Vec<_> = conn.watcher_vars().iter().map(|v| v.name.clone()).collect();
    assert_eq!(names, ["myvar", "counter"]);
    let counter = conn.variable("counter").unwrap();
    assert_eq!(counter.timestamp_mode, TimestampMode::Sparse);
    assert!(matches!(conn.variable("nope"), Err(WatcherError::UnknownVariable { .. })));

    // connecting again is a no-op
    let lists = device.commands().len();
    conn.connect().await.unwrap();
    assert_eq!(device.commands().len(), lists);
}

#[tokio::test]
async fn filtered_variable_lists_follow_the_device() {
    let device = FakeDevice::new(vars());
    let conn = device.connection(ConnectionMode::Control);
    conn.connect().await.unwrap();

    conn.send_commands([WatcherCommand::watch(vec!["counter".into()])]).unwrap();
    device.wait_for_command(|c| matches!(c, WatcherCommand::Watch { .. })).await;
    let watched: Vec<_> = conn.watched_vars().await.unwrap().into_iter().map(|v| v.name).collect();
    let unwatched: Vec<_> =
        conn.unwatched_vars().await.unwrap().into_iter().map(|v| v.name).collect();
    assert_eq!(watched, ["counter"]);
    assert_eq!(unwatched, ["myvar"]);
    assert!(conn.monitored_vars().await.unwrap().is_empty());

    device.set_timestamp(88_200);
    assert_eq!(conn.latest_timestamp().await.unwrap(), 88_200);

    assert_eq!(conn.check_vars::<&str>(&[]).unwrap(), ["myvar", "counter"]);
    assert!(matches!(
        conn.check_vars(&["myvar", "ghost"]),
        Err(WatcherError::UnknownVariable { name }) if name == "ghost"
    ));
}

#[tokio::test]
async fn a_second_connection_on_the_same_slot_supersedes_the_first() {
    let device = FakeDevice::new(vars());
    let first = device.connection(ConnectionMode::Stream);
    let second = device.connection(ConnectionMode::Stream);
    first.connect().await.unwrap();
    second.connect().await.unwrap();

    assert!(!first.is_connected());
    assert!(second.is_connected());
    let err = first.send_control(&serde_json::json!({"hello": 1})).unwrap_err();
    assert_eq!(kind(&err), Some(ConnectionErrorKind::Closed));

    // reconnecting takes the slot back
    first.connect().await.unwrap();
    assert!(first.is_connected());
    assert!(!second.is_connected());
}

#[tokio::test]
async fn monitor_and_control_exclude_each_other() {
    let device = FakeDevice::new(vars());
    let monitor = device.connection(ConnectionMode::Monitor);
    let control = device.connection(ConnectionMode::Control);
    let stream = device.connection(ConnectionMode::Stream);
    monitor.connect().await.unwrap();

    let err = control.connect().await.unwrap_err();
    assert_eq!(kind(&err), Some(ConnectionErrorKind::ModeConflict));
    assert!(!err.is_retryable());
    stream.connect().await.unwrap();

    monitor.disconnect().await;
    assert!(!device.registry().is_active(ConnectionMode::Monitor, &device.config().endpoint()));
    control.connect().await.unwrap();
    assert!(control.is_connected());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_releases_the_slot() {
    let device = FakeDevice::new(vars());
    let conn = device.connection(ConnectionMode::Log);
    conn.connect().await.unwrap();
    assert!(device.registry().is_active(ConnectionMode::Log, &device.config().endpoint()));

    conn.disconnect().await;
    conn.disconnect().await;
    assert!(!conn.is_connected());
    assert!(!device.registry().is_active(ConnectionMode::Log, &device.config().endpoint()));
    assert!(conn.send_data(vec![1, 2, 3]).is_err());
    assert!(matches!(conn.list().await, Err(WatcherError::Connection { .. })));
}

#[tokio::test]
async fn handshake_failures() {
    let config = quick_config();
    let hangup = CancellationToken::new();

    let binary = scripted(&config, WireMessage::Binary(vec![0]), hangup.clone());
    let conn = WatcherConnection::with_transport(
        config.clone(),
        ConnectionMode::Stream,
        binary,
        ModeRegistry::new(),
    );
    let err = conn.connect().await.unwrap_err();
    assert_eq!(kind(&err), Some(ConnectionErrorKind::Handshake));

    let wrong = scripted(&config, WireMessage::Text(r#"{"event":"hello"}"#.into()), hangup.clone());
    let conn = WatcherConnection::with_transport(
        config.clone(),
        ConnectionMode::Stream,
        wrong,
        ModeRegistry::new(),
    );
    let err = conn.connect().await.unwrap_err();
    assert_eq!(kind(&err), Some(ConnectionErrorKind::Handshake));
    assert!(!conn.is_connected());
    hangup.cancel();
}

#[tokio::test]
async fn refused_without_a_device() {
    let (connector, peers) = loopback();
    drop(peers);
    let conn = WatcherConnection::with_transport(
        quick_config(),
        ConnectionMode::Stream,
        Arc::new(connector),
        ModeRegistry::new(),
    );
    let err = conn.connect().await.unwrap_err();
    assert_eq!(kind(&err), Some(ConnectionErrorKind::Refused));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn device_hangup_takes_the_connection_down() {
    let config = quick_config();
    let hangup = CancellationToken::new();
    let hello = WireMessage::Text(r#"{"event":"connection","projectName":"synth"}"#.into());
    let connector = scripted(&config, hello, hangup.clone());
    let conn = WatcherConnection::with_transport(
        config,
        ConnectionMode::Watch,
        connector,
        ModeRegistry::new(),
    );

    conn.connect().await.unwrap();
    assert_eq!(conn.project_name().as_deref(), Some("synth"));
    assert_eq!(conn.sample_rate(), 48000.0);
    let token = conn.link_token().unwrap();

    hangup.cancel();
    tokio::time::timeout(Duration::from_secs(1), token.cancelled()).await.unwrap();
    assert!(!conn.is_connected());

    // nothing left to reconnect to
    assert!(conn.connect().await.is_err());
}
