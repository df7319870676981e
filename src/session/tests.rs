//! End-to-end session tests against an in-process device

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;

use super::*;
use crate::codec::{decode_outbound_buffer, encode_buffer_header};
use crate::test_utils::FakeDevice;
use crate::types::{TimestampMode, Value, VariableDescriptor};

fn var(name: &str, var_type: VarType) -> VariableDescriptor {
    VariableDescriptor::new(name, var_type, TimestampMode::Dense)
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let ok = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "timed out waiting for {what}");
}

async fn streamer(device: &FakeDevice) -> Streamer {
    let _ = tracing_subscriber::fmt::try_init();
    let streamer = Streamer::from_connection(device.connection(ConnectionMode::Stream));
    streamer.connect().await.unwrap();
    device.data_channel_open().await;
    streamer
}

fn is_watch(command: &WatcherCommand) -> bool {
    matches!(command, WatcherCommand::Watch { .. })
}

fn unwatches(device: &FakeDevice) -> usize {
    device.commands().iter().filter(|c| matches!(c, WatcherCommand::Unwatch { .. })).count()
}

fn queue_len(streamer: &Streamer, name: &str) -> usize {
    streamer.streaming_buffers_queue().get(name).map_or(0, Vec::len)
}

#[tokio::test]
async fn forever_session_queues_buffers_in_arrival_order() {
    let device = FakeDevice::new(vec![var("myvar", VarType::Float64)]);
    let streamer = streamer(&device).await;

    streamer.start_streaming(&["myvar"], SessionOptions::default()).await.unwrap();
    assert_eq!(streamer.streaming_mode(), StreamingMode::Forever);
    device.wait_for_command(is_watch).await;
    assert!(device.is_watched("myvar"));

    for i in 0..3 {
        device.send_buffer(0, &device.buffer(0, i * 512));
    }
    eventually("three buffers", || queue_len(&streamer, "myvar") == 3).await;

    let queues = streamer.stop_streaming(&["myvar"]).await.unwrap();
    let buffers = &queues["myvar"];
    assert_eq!(buffers.len(), 3);
    for (i, buffer) in buffers.iter().enumerate() {
        assert_eq!(buffer.ref_timestamp(), i as u64 * 512);
        assert_eq!(buffer.len(), 512);
    }
    assert_eq!(streamer.streaming_mode(), StreamingMode::Off);
    // one unwatch opens the session, one closes it
    eventually("closing unwatch", || unwatches(&device) == 2).await;

    let last = streamer.last_streamed_buffer("myvar").unwrap();
    assert_eq!(last.timestamps.first(), Some(&1024));
    assert_eq!(last.values.len(), 512);
    assert_eq!(streamer.streaming_buffers_data()["myvar"].len(), 3 * 512);
}

#[tokio::test]
async fn start_unwatches_everything_first() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32), var("b", VarType::Float32)]);
    let streamer = streamer(&device).await;

    streamer.start_streaming(&["b"], SessionOptions::default()).await.unwrap();
    device.wait_for_command(is_watch).await;
    let commands = device.commands();
    let n = commands.len();
    assert_eq!(commands[n - 2], WatcherCommand::Unwatch { watchers: vec!["a".into(), "b".into()] });
    assert_eq!(commands[n - 1], WatcherCommand::watch(vec!["b".into()]));

    let err = streamer.start_streaming(&["nope"], SessionOptions::default()).await.unwrap_err();
    assert!(matches!(err, WatcherError::UnknownVariable { .. }));
}

#[tokio::test]
async fn n_values_sizes_each_queue_by_its_own_buffer_length() {
    // v1 carries 1024 values per buffer, v2 512
    let device = FakeDevice::new(vec![var("v1", VarType::Int32), var("v2", VarType::Float64)]);
    let streamer = streamer(&device).await;

    let (queues, ()) = tokio::join!(
        streamer.stream_n_values(&["v1", "v2"], 100, SessionOptions::default()),
        async {
            device.wait_for_command(is_watch).await;
            device.send_buffer(0, &device.buffer(0, 0));
            device.send_buffer(1, &device.buffer(1, 0));
        }
    );
    let queues = queues.unwrap();
    assert_eq!(queues["v1"].len(), 1);
    assert_eq!(queues["v2"].len(), 1);
    assert_eq!(streamer.streaming_mode(), StreamingMode::Off);
}

#[tokio::test]
async fn n_values_completion_waits_for_the_slowest_variable() {
    let device = FakeDevice::new(vec![var("v1", VarType::Int32), var("v2", VarType::Float64)]);
    let streamer = streamer(&device).await;

    // 1500 values: 2 buffers of v1, 3 of v2
    let (queues, ()) = tokio::join!(
        streamer.stream_n_values(&["v1", "v2"], 1500, SessionOptions::default()),
        async {
            device.wait_for_command(is_watch).await;
            for r in 0..3u64 {
                device.send_buffer(0, &device.buffer(0, r * 1024));
                device.send_buffer(1, &device.buffer(1, r * 512));
            }
        }
    );
    let queues = queues.unwrap();
    assert_eq!(queues["v1"].len(), 2);
    assert_eq!(queues["v2"].len(), 3);
    assert_eq!(streamer.streaming_mode(), StreamingMode::Off);
    eventually("closing unwatch", || unwatches(&device) == 2).await;
}

#[tokio::test]
async fn type_mismatch_drops_only_the_faulty_buffer() {
    let device = FakeDevice::new(vec![var("a", VarType::Float64), var("b", VarType::Int32)]);
    let streamer = streamer(&device).await;
    streamer.start_streaming::<&str>(&[], SessionOptions::default()).await.unwrap();
    device.wait_for_command(is_watch).await;

    device.send_buffer(0, &device.buffer(0, 0));
    // header says float, channel 1 is declared int
    device.send_raw(encode_buffer_header(1, VarType::Float32));
    let body = crate::codec::encode_buffer_body(&device.buffer(1, 0), VarType::Int32).unwrap();
    device.send_raw(body);
    // unknown type tag
    device.send_raw(b"0x\0".to_vec());
    device.send_buffer(1, &device.buffer(1, 1024));
    device.send_buffer(0, &device.buffer(0, 512));

    eventually("both variables", || {
        queue_len(&streamer, "a") == 2 && queue_len(&streamer, "b") == 1
    })
    .await;
    assert_eq!(streamer.protocol_faults(), 2);
    let queues = streamer.streaming_buffers_queue();
    assert_eq!(queues["b"][0].ref_timestamp(), 1024);
    assert_eq!(queues["a"][1].ref_timestamp(), 512);
}

#[tokio::test]
async fn saving_writes_one_json_line_per_buffer_and_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let device = FakeDevice::new(vec![var("myvar", VarType::Float64)]);
    let streamer = streamer(&device).await;
    let options = || SessionOptions::default().save_to(dir.path());

    for session in 0..2u64 {
        streamer.start_streaming(&["myvar"], options()).await.unwrap();
        device.wait_for_command(is_watch).await;
        for i in 0..2 {
            device.send_buffer(0, &device.buffer(0, session * 10_000 + i * 512));
        }
        eventually("saved buffers", || queue_len(&streamer, "myvar") == 2).await;
        streamer.stop_streaming(&["myvar"]).await.unwrap();
    }

    let first = streamer.load_data_from_file(dir.path().join("myvar_var_stream.txt")).unwrap();
    let second = streamer.load_data_from_file(dir.path().join("myvar_var_stream__1.txt")).unwrap();
    assert_eq!(first.iter().map(|b| b.ref_timestamp()).collect::<Vec<_>>(), vec![0, 512]);
    assert_eq!(second.iter().map(|b| b.ref_timestamp()).collect::<Vec<_>>(), vec![10_000, 10_512]);
    assert!(first.iter().all(|b| b.len() == 512));
}

#[tokio::test]
async fn callbacks_see_every_buffer_before_stop_returns() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32), var("b", VarType::Int32)]);
    let streamer = streamer(&device).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let blocks = Arc::new(Mutex::new(Vec::new()));

    let counter = seen.clone();
    let on_buffer = Callback::on_buffer(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let options = SessionOptions::default().callback(on_buffer);
    streamer.start_streaming(&["a", "b"], options).await.unwrap();
    device.wait_for_command(is_watch).await;
    for i in 0..4 {
        device.send_buffer(i % 2, &device.buffer(i % 2, i as u64));
    }
    eventually("queued buffers", || {
        queue_len(&streamer, "a") + queue_len(&streamer, "b") == 4
    })
    .await;
    streamer.stop_streaming::<&str>(&[]).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 4);

    let sink = blocks.clone();
    let on_block = Callback::on_block(move |block| {
        sink.lock().unwrap().push(block.into_iter().map(|e| e.name).collect::<Vec<_>>());
        Ok(())
    });
    let options = SessionOptions::default().callback(on_block);
    streamer.start_streaming(&["b", "a"], options).await.unwrap();
    device.wait_for_command(is_watch).await;
    device.send_buffer(0, &device.buffer(0, 0));
    device.send_buffer(1, &device.buffer(1, 0));
    eventually("block buffers", || {
        queue_len(&streamer, "a") + queue_len(&streamer, "b") == 2
    })
    .await;
    streamer.stop_streaming::<&str>(&[]).await.unwrap();
    assert_eq!(*blocks.lock().unwrap(), vec![vec!["b".to_string(), "a".to_string()]]);
}

#[tokio::test]
async fn starting_again_stops_the_running_session() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
    let streamer = streamer(&device).await;
    streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap();
    device.send_buffer(0, &device.buffer(0, 0));
    eventually("first buffer", || queue_len(&streamer, "a") == 1).await;

    streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap();
    assert_eq!(streamer.streaming_mode(), StreamingMode::Forever);
    assert_eq!(queue_len(&streamer, "a"), 0);
    eventually("second watch", || {
        device.commands().iter().filter(|c| is_watch(c)).count() == 2
    })
    .await;
    assert!(unwatches(&device) >= 2);
}

#[tokio::test]
async fn queue_length_setter_resizes_and_clears() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
    let streamer = streamer(&device).await;
    streamer.set_streaming_buffers_queue_length(2);
    streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap();
    for i in 0..5 {
        device.send_buffer(0, &device.buffer(0, i * 1024));
    }
    eventually("ring full", || {
        streamer.streaming_buffers_queue()["a"].last().map(|b| b.ref_timestamp()) == Some(4 * 1024)
    })
    .await;
    assert_eq!(queue_len(&streamer, "a"), 2);

    streamer.flush_queue();
    assert_eq!(queue_len(&streamer, "a"), 0);
    assert_eq!(streamer.streaming_buffers_queue_length(), 2);
}

#[tokio::test]
async fn scheduled_streaming_returns_after_the_device_stops() {
    let device = FakeDevice::new(vec![var("a", VarType::Float32)]);
    let streamer = streamer(&device).await;

    // 4410 frames at 44.1 kHz: watched for about 100 ms
    let queues = tokio::time::timeout(
        Duration::from_secs(5),
        streamer.schedule_streaming(&["a"], &[0], &[4410], SessionOptions::default()),
    )
    .await
    .expect("schedule never finished")
    .unwrap();
    assert!(queues.contains_key("a"));
    assert_eq!(streamer.streaming_mode(), StreamingMode::Off);

    // the device stopped on its own, so no unwatch follows the scheduled watch
    let commands = device.commands();
    let scheduled = commands.iter().rposition(is_watch).unwrap();
    assert!(!commands[scheduled..].iter().any(|c| matches!(c, WatcherCommand::Unwatch { .. })));

    let err = streamer
        .schedule_streaming(&["a"], &[0, 1], &[1], SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WatcherError::InvalidArgument { .. }));
}

#[tokio::test]
async fn send_buffer_packs_an_outbound_buffer() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
    let streamer = streamer(&device).await;
    streamer.send_buffer(7, VarType::Float32, &Samples::Float32(vec![0.5, 1.5, 2.5])).unwrap();

    eventually("outbound buffer", || !device.received().is_empty()).await;
    let sent = decode_outbound_buffer(&device.received()[0]).unwrap();
    assert_eq!(sent.id, 7);
    assert_eq!(sent.var_type, VarType::Float32);
    assert_eq!(sent.values, Samples::Float32(vec![0.5, 1.5, 2.5]));
}

#[tokio::test]
async fn latest_buffer_subscription() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
    let streamer = streamer(&device).await;
    let mut latest = streamer.subscribe_latest(UpdateRate::Native);
    streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap();
    device.send_buffer(0, &device.buffer(0, 2048));

    let event = tokio::time::timeout(Duration::from_secs(2), latest.next()).await.unwrap().unwrap();
    assert_eq!(event.name, "a");
    assert_eq!(event.buffer.ref_timestamp(), 2048);
}

#[tokio::test]
async fn disconnect_ends_the_session() {
    let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
    let streamer = streamer(&device).await;
    streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap();
    streamer.disconnect().await;
    assert!(!streamer.is_streaming());
    assert!(!streamer.connection().is_connected());

    let err = streamer.start_streaming(&["a"], SessionOptions::default()).await.unwrap_err();
    assert!(matches!(err, WatcherError::Connection { .. }));
}

mod monitoring {
    use super::*;

    async fn monitor(device: &FakeDevice) -> Monitor {
        let monitor = Monitor::from_connection(device.connection(ConnectionMode::Monitor));
        monitor.connect().await.unwrap();
        device.data_channel_open().await;
        monitor
    }

    fn is_monitor(command: &WatcherCommand) -> bool {
        matches!(command, WatcherCommand::Monitor { periods, .. } if periods.iter().all(|&p| p > 0))
    }

    fn monitors_with(command: &WatcherCommand, expected: &[u32]) -> bool {
        matches!(command, WatcherCommand::Monitor { periods, .. } if periods == expected)
    }

    #[tokio::test]
    async fn period_zero_leaves_the_monitored_set() {
        let device =
            FakeDevice::new(vec![var("m", VarType::Float64), var("other", VarType::Int32)]);
        let monitor = monitor(&device).await;
        assert_eq!(monitor.streamer().streaming_buffers_queue_length(), 2000);

        monitor.start_monitoring(&["m"], &[1000], SessionOptions::default()).await.unwrap();
        device.wait_for_command(is_monitor).await;
        let monitored = monitor.connection().monitored_vars().await.unwrap();
        assert_eq!(monitored.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(), ["m"]);

        for t in [100, 200, 300] {
            device.send_buffer(0, &device.sample(0, t));
        }
        eventually("samples", || monitor.values()["m"].timestamps.len() == 3).await;

        let values = monitor.stop_monitoring(&["m"]).await.unwrap();
        assert_eq!(values.keys().collect::<Vec<_>>(), ["m"]);
        assert_eq!(values["m"].timestamps, vec![100, 200, 300]);
        assert_eq!(values["m"].values, vec![100.0, 200.0, 300.0]);

        device.wait_for_command(|c| monitors_with(c, &[0])).await;
        assert!(monitor.connection().monitored_vars().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn monitor_n_values_counts_samples() {
        let device = FakeDevice::new(vec![var("m", VarType::Int32)]);
        let monitor = monitor(&device).await;

        let (values, ()) = tokio::join!(
            monitor.monitor_n_values(&["m"], &[], 3, SessionOptions::default()),
            async {
                device.wait_for_command(is_monitor).await;
                for t in 0..5 {
                    device.send_buffer(0, &device.sample(0, t * 10));
                }
            }
        );
        let values = values.unwrap();
        assert_eq!(values["m"].timestamps, vec![0, 10, 20]);
        assert!(!monitor.is_monitoring());
        // the default period was used
        assert!(device.commands().iter().any(|c| monitors_with(c, &[1000])));
    }

    #[tokio::test]
    async fn peek_returns_one_sample_per_variable() {
        let device = FakeDevice::new(vec![var("a", VarType::Int32), var("b", VarType::Float64)]);
        let monitor = monitor(&device).await;

        let (peeked, ()) = tokio::join!(monitor.peek::<&str>(&[]), async {
            device.wait_for_command(is_monitor).await;
            device.send_buffer(1, &device.sample(1, 5));
            device.send_buffer(0, &device.sample(0, 6));
            device.send_buffer(0, &device.sample(0, 7));
        });
        let peeked = peeked.unwrap();
        assert_eq!(peeked["a"], MonitorSample { timestamp: 6, value: Value::Int(6) });
        assert_eq!(peeked["b"].timestamp, 5);
        assert!(!monitor.is_monitoring());
        device.wait_for_command(|c| monitors_with(c, &[0, 0])).await;
    }

    #[tokio::test]
    async fn peek_times_out_without_samples() {
        let device = FakeDevice::new(vec![var("a", VarType::Int32)]);
        let monitor = monitor(&device).await;
        let err = monitor.peek(&["a"]).await.unwrap_err();
        assert!(matches!(err, WatcherError::Timeout { .. }));
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test]
    async fn saved_monitor_files_flatten() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(vec![var("m", VarType::Float64)]);
        let monitor = monitor(&device).await;

        let options = SessionOptions::default().save_to(dir.path());
        monitor.start_monitoring(&["m"], &[500], options).await.unwrap();
        device.wait_for_command(is_monitor).await;
        device.send_buffer(0, &device.sample(0, 1));
        device.send_buffer(0, &device.sample(0, 2));
        eventually("samples", || monitor.values()["m"].timestamps.len() == 2).await;
        monitor.stop_monitoring::<&str>(&[]).await.unwrap();

        let flat = monitor.load_data_from_file(dir.path().join("m_monitor.txt")).unwrap();
        assert_eq!(flat.timestamps, vec![1, 2]);
        assert_eq!(flat.values, vec![1.0, 2.0]);
    }
}
