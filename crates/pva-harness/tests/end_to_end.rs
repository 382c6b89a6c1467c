//! End-to-end tests over real loopback sockets: discovery, validation,
//! channel creation, data operations, monitors.

use std::time::Duration;

use pva_client::{ChannelState, ClientError, MonitorEvent};
use pva_harness::{EchoRpcRecord, SingleRecordProvider, SlowProcessRecord, TestCluster};
use pva_proto::{BitSet, PvStructure, PvValue};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn within<T, F: std::future::Future<Output = T>>(fut: F) -> T {
    timeout(WAIT, fut).await.expect("timed out")
}

#[tokio::test]
async fn plain_get_round_trip() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("int1", 42);

    let channel = cluster.client.create_channel("int1", 0);
    within(channel.wait_connected()).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    let get = within(channel.get("field(value)")).await.unwrap();
    let (value, changed) = within(get.get()).await.unwrap();

    assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(42));
    // root and value offsets of the projected {value} structure
    assert_eq!(changed, BitSet::from_bits([0, 1]));
}

#[tokio::test]
async fn get_of_whole_structure_includes_nested_fields() {
    let cluster = TestCluster::start().await.unwrap();
    let record = cluster.add_int_record("full", 5);
    record.post_field("alarm.message", "LOLO".into());

    let channel = cluster.client.create_channel("full", 0);
    within(channel.wait_connected()).await.unwrap();

    let get = within(channel.get("")).await.unwrap();
    let (value, _changed) = within(get.get()).await.unwrap();
    assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(5));
    assert_eq!(value.get("alarm.message").and_then(|v| v.as_str()), Some("LOLO"));
}

#[tokio::test]
async fn put_writes_through_to_the_record() {
    let cluster = TestCluster::start().await.unwrap();
    let record = cluster.add_int_record("target", 0);

    let channel = cluster.client.create_channel("target", 0);
    within(channel.wait_connected()).await.unwrap();

    let put = within(channel.put("field(value)")).await.unwrap();
    let iface = put.interface().unwrap();
    let mut value = PvStructure::new(iface.clone());
    value.set("value", 7i32.into()).unwrap();
    let offset = iface.offset_of("value").unwrap();

    let status = within(put.put(value, BitSet::from_bits([offset]))).await.unwrap();
    assert!(status.is_success());
    assert_eq!(record.snapshot().get("value").and_then(PvValue::as_i32), Some(7));

    // the read-back half of the put operation
    let (back, _) = within(put.get()).await.unwrap();
    assert_eq!(back.get("value").and_then(PvValue::as_i32), Some(7));
}

#[tokio::test]
async fn put_get_returns_the_updated_value() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("pg", 1);

    let channel = cluster.client.create_channel("pg", 0);
    within(channel.wait_connected()).await.unwrap();

    let put_get = within(channel.put_get("field(value)")).await.unwrap();
    let mut value = PvStructure::new(put_get.put_interface().unwrap());
    value.set("value", 13i32.into()).unwrap();

    let (result, _) = within(put_get.put_get(value, BitSet::from_bits([0]))).await.unwrap();
    assert_eq!(result.get("value").and_then(PvValue::as_i32), Some(13));

    let (current, _) = within(put_get.get_get()).await.unwrap();
    assert_eq!(current.get("value").and_then(PvValue::as_i32), Some(13));
}

#[tokio::test]
async fn process_completes_once() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("proc", 0);

    let channel = cluster.client.create_channel("proc", 0);
    within(channel.wait_connected()).await.unwrap();

    let process = within(channel.process()).await.unwrap();
    let status = within(process.process()).await.unwrap();
    assert!(status.is_success());
}

#[tokio::test]
async fn rpc_echoes_arguments() {
    let record = EchoRpcRecord::new();
    let provider = SingleRecordProvider::new("svc:echo", record);
    let cluster = TestCluster::start_with(vec![provider]).await.unwrap();

    let channel = cluster.client.create_channel("svc:echo", 0);
    within(channel.wait_connected()).await.unwrap();

    let rpc = within(channel.rpc()).await.unwrap();
    let mut args = PvStructure::new(pva_harness::int_descriptor());
    args.set("value", 99i32.into()).unwrap();

    let reply = within(rpc.request(args.clone())).await.unwrap();
    assert_eq!(reply, args);

    // arbitrary number of calls per operation
    let reply2 = within(rpc.request(args.clone())).await.unwrap();
    assert_eq!(reply2, args);
}

#[tokio::test]
async fn monitor_delivers_initial_value_and_updates() {
    let cluster = TestCluster::start().await.unwrap();
    let record = cluster.add_int_record("mon", 10);

    let channel = cluster.client.create_channel("mon", 0);
    within(channel.wait_connected()).await.unwrap();

    let mut monitor = within(channel.monitor("field(value)")).await.unwrap();
    monitor.start().unwrap();

    // initial snapshot arrives first
    let first = within(monitor.recv()).await.expect("monitor stream ended");
    match first {
        MonitorEvent::Update { value, .. } => {
            assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(10));
        }
        other => panic!("expected update, got {other:?}"),
    }

    record.post_field("value", 11i32.into());
    record.post_field("value", 12i32.into());

    let mut seen = Vec::new();
    while seen.last() != Some(&12) {
        match within(monitor.recv()).await.expect("monitor stream ended") {
            MonitorEvent::Update { value, .. } => {
                seen.push(value.get("value").and_then(PvValue::as_i32).unwrap_or(-1));
            }
            MonitorEvent::Disconnected | MonitorEvent::Unlisten => {
                panic!("monitor ended early; saw {seen:?}")
            }
        }
    }
    // updates arrive in order; coalescing may drop 11 but never reorders
    assert!(seen == vec![11, 12] || seen == vec![12], "saw {seen:?}");
}

#[tokio::test]
async fn pipeline_monitor_flows_with_credit() {
    let cluster = TestCluster::start().await.unwrap();
    let record = cluster.add_int_record("pipe", 0);

    let channel = cluster.client.create_channel("pipe", 0);
    within(channel.wait_connected()).await.unwrap();

    let mut monitor =
        within(channel.monitor("record[queueSize=2,pipeline=true]field(value)")).await.unwrap();
    monitor.start().unwrap();

    for v in 1..=6i32 {
        record.post_field("value", v.into());
    }

    // drain until the final value arrives, releasing credit as we go;
    // coalescing under the small queue is fine, data loss is not silent
    let mut last = None;
    let mut overrun_seen = false;
    while last != Some(6) {
        match within(monitor.recv()).await.expect("monitor stream ended") {
            MonitorEvent::Update { value, overrun, .. } => {
                last = value.get("value").and_then(PvValue::as_i32);
                overrun_seen |= !overrun.is_empty();
                monitor.release().unwrap();
            }
            other => panic!("expected update, got {other:?}"),
        }
    }
    assert_eq!(last, Some(6));
    // six posts through a depth-2 pipeline queue must have squashed
    assert!(overrun_seen, "expected a coalesced update with overrun bits");
}

#[tokio::test]
async fn get_field_returns_the_introspection_descriptor() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("typed", 0);

    let channel = cluster.client.create_channel("typed", 0);
    within(channel.wait_connected()).await.unwrap();

    let whole = within(channel.get_field("")).await.unwrap();
    match whole {
        pva_proto::FieldDesc::Structure(desc) => {
            assert_eq!(desc.type_id, "epics:nt/NTScalar:1.0");
            assert!(desc.field("alarm").is_some());
        }
        other => panic!("expected structure, got {other:?}"),
    }

    let sub = within(channel.get_field("alarm.severity")).await.unwrap();
    assert_eq!(sub, pva_proto::FieldDesc::scalar(pva_proto::ScalarKind::I32));

    let missing = within(channel.get_field("nope")).await;
    assert!(matches!(missing, Err(ClientError::Server(_))));
}

#[tokio::test]
async fn array_slices_and_lengths() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_array_record("arr", vec![1.0, 2.0, 3.0, 4.0]);

    let channel = cluster.client.create_channel("arr", 0);
    within(channel.wait_connected()).await.unwrap();

    let array = within(channel.array("field(value)")).await.unwrap();

    let (length, _capacity) = within(array.get_length()).await.unwrap();
    assert_eq!(length, 4);

    let slice = within(array.get_slice(1, 2)).await.unwrap();
    assert_eq!(slice, PvValue::F64Array(vec![2.0, 3.0]));

    within(array.put_slice(0, PvValue::F64Array(vec![9.0]))).await.unwrap();
    let slice = within(array.get_slice(0, -1)).await.unwrap();
    assert_eq!(slice, PvValue::F64Array(vec![9.0, 2.0, 3.0, 4.0]));

    within(array.set_length(2, -1)).await.unwrap();
    let (length, _) = within(array.get_length()).await.unwrap();
    assert_eq!(length, 2);
}

#[tokio::test]
async fn overlapping_calls_fail_locally() {
    let record = SlowProcessRecord::new(Duration::from_millis(400));
    let provider = SingleRecordProvider::new("slow", record);
    let cluster = TestCluster::start_with(vec![provider]).await.unwrap();

    let channel = cluster.client.create_channel("slow", 0);
    within(channel.wait_connected()).await.unwrap();

    let process = std::sync::Arc::new(within(channel.process()).await.unwrap());
    let p2 = process.clone();
    let first = tokio::spawn(async move { p2.process().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // second call while the first is in flight
    let second = process.process().await;
    assert!(matches!(second, Err(ClientError::AlreadyInFlight)));

    // the first still completes exactly once
    let first = within(first).await.unwrap();
    assert!(first.unwrap().is_success());
}

#[tokio::test]
async fn destroy_during_in_flight_call_cancels_exactly_once() {
    let record = SlowProcessRecord::new(Duration::from_secs(30));
    let provider = SingleRecordProvider::new("stuck", record);
    let cluster = TestCluster::start_with(vec![provider]).await.unwrap();

    let channel = cluster.client.create_channel("stuck", 0);
    within(channel.wait_connected()).await.unwrap();

    let process = within(channel.process()).await.unwrap();
    let handle = tokio::spawn(async move { process.process().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // destroying the channel cancels the in-flight call
    channel.destroy();
    assert_eq!(channel.state(), ChannelState::Destroyed);

    let result = within(handle).await.unwrap();
    assert!(
        matches!(result, Err(ClientError::Cancelled | ClientError::Disconnected)),
        "got {result:?}"
    );
}

#[tokio::test]
async fn unknown_channel_stays_searching() {
    let cluster = TestCluster::start().await.unwrap();
    let channel = cluster.client.create_channel("does:not:exist", 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(channel.state(), ChannelState::NeverConnected);
    assert_eq!(cluster.client.searching_count(), 1);
}

#[tokio::test]
async fn server_shutdown_disconnects_channels() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("gone", 1);

    let channel = cluster.client.create_channel("gone", 0);
    within(channel.wait_connected()).await.unwrap();

    let mut watch = channel.state_watch();
    cluster.server.close();

    within(async {
        loop {
            if *watch.borrow_and_update() == ChannelState::Disconnected {
                return;
            }
            watch.changed().await.expect("channel dropped");
        }
    })
    .await;

    // a registered connect-state listener sees the disconnect before any
    // destroy
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn last_request_destroys_after_completion() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("oneshot", 3);

    let channel = cluster.client.create_channel("oneshot", 0);
    within(channel.wait_connected()).await.unwrap();

    let get = within(channel.get("field(value)")).await.unwrap();
    get.set_last_request();
    let (value, _) = within(get.get()).await.unwrap();
    assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(3));

    // the operation destroyed itself after the done event
    let again = get.get().await;
    assert!(matches!(again, Err(ClientError::Destroyed)), "got {again:?}");
}
