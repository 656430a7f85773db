//! End-to-end scenarios against the in-process native fixtures, covering
//! the testable properties and concrete scenarios of the bridge's
//! channel/service/trampoline/task-service/handshake surface.

use flow_bridge::channel::ServiceVTable;
use flow_bridge::handshakes::combine::Combine;
use flow_bridge::service::Service;
use flow_bridge::trampoline::TrampolineServer;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn uppercase_vtable() -> ServiceVTable {
    ServiceVTable::new(
        native_fixtures::uppercase::upper_case_create,
        native_fixtures::uppercase::upper_case_invoke1,
        native_fixtures::uppercase::upper_case_invoke4,
        native_fixtures::uppercase::upper_case_invoke16,
        native_fixtures::uppercase::upper_case_drop,
    )
}

fn combine_vtable() -> ServiceVTable {
    ServiceVTable::new(
        native_fixtures::combine::combine_create,
        native_fixtures::combine::combine_invoke1,
        native_fixtures::combine::combine_invoke4,
        native_fixtures::combine::combine_invoke16,
        native_fixtures::combine::combine_drop,
    )
}

fn derive_vtable() -> ServiceVTable {
    ServiceVTable::new(
        native_fixtures::derive::derive_create,
        native_fixtures::derive::derive_invoke1,
        native_fixtures::derive::derive_invoke4,
        native_fixtures::derive::derive_invoke16,
        native_fixtures::derive::derive_drop,
    )
}

// S1: vectorization equivalence. The native side dispatches 37 frames as
// 16+16+4+1; the result must equal 37 stride-1 invocations.
#[test]
fn s1_vectorization_equivalence() {
    // SAFETY: `uppercase_vtable` matches the ABI the fixture implements.
    let mut service =
        unsafe { Service::create(uppercase_vtable(), 0, |_log: ops::Log| {}).unwrap() };

    for _ in 0..37 {
        // SAFETY: the literal lives for the duration of this call.
        unsafe { service.enqueue_bytes(0, b"hello") };
    }
    let out = service.poll().unwrap();

    assert_eq!(out.out.len(), 37);
    let mut last_code = 0;
    for frame in out.out {
        assert_eq!(out.bytes(frame), b"HELLO");
        assert!(frame.code > last_code, "codes must strictly increase");
        last_code = frame.code;
    }
    service.destroy();
}

// S2: pinning-buffer growth. A tiny initial buffer must grow without
// corrupting frames already pinned within the same batch.
#[test]
fn s2_pinning_buffer_growth_mid_batch() {
    // SAFETY: see s1.
    let mut service =
        unsafe { Service::create(uppercase_vtable(), 0, |_log: ops::Log| {}).unwrap() };

    service.enqueue_message(0, &RawBytes(b"hello".to_vec()));
    service.enqueue_message(0, &RawBytes(b"world".to_vec()));
    let out = service.poll().unwrap();

    assert_eq!(out.out.len(), 2);
    assert_eq!(out.bytes(&out.out[0]), b"HELLO");
    assert_eq!(out.bytes(&out.out[1]), b"WORLD");
    service.destroy();
}

/// Wraps a raw byte payload so it can flow through `enqueue_message`,
/// which is what actually exercises the pinning buffer's growth path (vs.
/// `enqueue_bytes`, which references caller-owned memory directly).
#[derive(Debug)]
struct RawBytes(Vec<u8>);

impl prost::Message for RawBytes {
    fn encode_raw(&self, buf: &mut impl bytes::BufMut)
    where
        Self: Sized,
    {
        buf.put_slice(&self.0);
    }
    fn merge_field(
        &mut self,
        _tag: u32,
        _wire_type: prost::encoding::WireType,
        _buf: &mut impl bytes::Buf,
        _ctx: prost::encoding::DecodeContext,
    ) -> Result<(), prost::DecodeError>
    where
        Self: Sized,
    {
        unimplemented!("write-only test helper")
    }
    fn encoded_len(&self) -> usize {
        self.0.len()
    }
    fn clear(&mut self) {
        unimplemented!("write-only test helper")
    }
}

// S3: channel error. The magic "whoops" payload raises a channel error
// whose message is exactly "whoops".
#[test]
fn s3_channel_error() {
    // SAFETY: see s1.
    let mut service =
        unsafe { Service::create(uppercase_vtable(), 0, |_log: ops::Log| {}).unwrap() };

    // SAFETY: literal lives for the call.
    unsafe { service.enqueue_bytes(0, b"whoops") };
    let err = service.poll().unwrap_err();
    assert_eq!(err.to_string(), "whoops");
    service.destroy();
}

// S4: trampoline correlation. Two handlers, three started tasks; every
// task id gets exactly one matching, ok=1 reply (order unspecified).
#[tokio::test]
async fn s4_trampoline_correlation() {
    let mut server = TrampolineServer::new();
    server.register(10, |payload: &[u8], _cancel: CancellationToken| {
        let payload = payload.to_vec();
        async move {
            let mut body = vec![0u8; flow_bridge::trampoline::REPLY_HEADER_LEN];
            body.extend_from_slice(&payload);
            Ok(body)
        }
    });
    server.register(20, |payload: &[u8], _cancel: CancellationToken| {
        let payload = payload.to_vec();
        async move {
            let mut body = vec![0u8; flow_bridge::trampoline::REPLY_HEADER_LEN];
            body.extend_from_slice(&payload);
            Ok(body)
        }
    });

    let mut request = Vec::new();
    request.extend_from_slice(&1u64.to_le_bytes());
    request.extend_from_slice(&10u32.to_le_bytes());
    request.extend_from_slice(b"A");
    server.start_task(&request);

    let mut request = Vec::new();
    request.extend_from_slice(&2u64.to_le_bytes());
    request.extend_from_slice(&20u32.to_le_bytes());
    request.extend_from_slice(b"B");
    server.start_task(&request);

    let mut request = Vec::new();
    request.extend_from_slice(&3u64.to_le_bytes());
    request.extend_from_slice(&10u32.to_le_bytes());
    request.extend_from_slice(b"C");
    server.start_task(&request);

    let mut replies = std::collections::HashMap::new();
    for _ in 0..3 {
        let reply = server.recv().await;
        replies.insert(reply.task_id, reply.body);
    }

    assert_eq!(replies.len(), 3);
    for (task_id, expected) in [(1u64, b'A'), (2, b'B'), (3, b'C')] {
        let body = &replies[&task_id];
        assert_eq!(body[8], 1, "task {task_id} should be ok");
        assert_eq!(body[9], expected);
    }
}

// S5: trampoline cancellation. A handler that blocks until cancelled still
// produces exactly one reply, with ok=0 and a non-empty error body.
#[tokio::test]
async fn s5_trampoline_cancellation() {
    let mut server = TrampolineServer::new();
    server.register(1, |_payload: &[u8], cancel: CancellationToken| async move {
        cancel.cancelled().await;
        Err("cancelled".to_string())
    });

    let mut request = Vec::new();
    request.extend_from_slice(&42u64.to_le_bytes());
    request.extend_from_slice(&1u32.to_le_bytes());
    server.start_task(&request);

    server.stop().await;

    let reply = server.try_recv().expect("reply must be present after stop()");
    assert_eq!(reply.task_id, 42);
    assert_eq!(reply.body[8], 0, "cancelled task must reply ok=0");
    assert!(reply.body.len() > flow_bridge::trampoline::REPLY_HEADER_LEN);
}

// S6: task-service drop ordering. After drop, the gRPC call already
// completed, the log forwarder observed EOF, and the socket file is gone.
//
// Needs a multi-threaded runtime: `TaskService::drop` blocks its calling
// thread across the whole teardown sequence, and closing the gRPC channel
// requires its background connection-driver task to run concurrently on
// another worker -- exactly what a production host runtime provides.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_task_service_drop_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let logs: Arc<Mutex<Vec<ops::Log>>> = Arc::new(Mutex::new(Vec::new()));
    let logs_clone = logs.clone();

    // SAFETY: matching create/drop pair from the fixture crate.
    let service = unsafe {
        flow_bridge::task_service::TaskService::create(
            native_fixtures::task_service::fixture_task_service_create,
            native_fixtures::task_service::fixture_task_service_drop,
            "s6-fixture",
            dir.path(),
            None,
            Default::default(),
            move |log| logs_clone.lock().unwrap().push(log),
        )
        .await
        .unwrap()
    };

    let mut client =
        native_fixtures::task_service::echo::echo_client::EchoClient::new(service.conn().clone());
    let response = client
        .ping(native_fixtures::task_service::echo::EchoRequest {
            message: "ping".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "ping");

    let socket_path = flow_bridge::util::socket_path(dir.path(), "s6-fixture");
    assert!(socket_path.exists());

    drop(service);
    // Dropping blocks on the log-forwarder's EOF, so by the time we reach
    // here both the forwarder has terminated and the socket file is gone.
    assert!(!socket_path.exists());
    assert!(!logs.lock().unwrap().is_empty(), "fixture logs a startup line");
}

// S7: combine fixture via the host-side handshake.
#[test]
fn s7_combine_handshake_drains_triples_and_trailing_stats() {
    // SAFETY: `combine_vtable` matches the fixture's ABI.
    let service = unsafe { Service::create(combine_vtable(), 0, |_log: ops::Log| {}).unwrap() };
    let mut combine = Combine::new(service);

    let config = serde_json::json!({
        "key_ptr": ["/i"],
        "field_ptrs": ["/s/1", "/i"],
    })
    .to_string();
    combine.configure(config.as_bytes()).unwrap();

    combine
        .reduce_left(serde_json::json!({"i": 42, "s": ["two"]}).to_string().as_bytes())
        .unwrap();
    combine
        .combine_right(serde_json::json!({"i": 32, "s": ["one"]}).to_string().as_bytes())
        .unwrap();
    combine
        .combine_right(serde_json::json!({"i": 42, "s": ["three"]}).to_string().as_bytes())
        .unwrap();
    combine
        .combine_right(serde_json::json!({"i": 32, "s": ["four"]}).to_string().as_bytes())
        .unwrap();

    let (drained, stats) = combine.drain().unwrap();
    assert_eq!(drained.len(), 2);
    assert!(!stats.is_empty());

    let mut by_i: std::collections::HashMap<i64, &flow_bridge::handshakes::combine::Drained> =
        Default::default();
    for d in &drained {
        let doc: serde_json::Value = serde_json::from_slice(&d.document).unwrap();
        by_i.insert(doc["i"].as_i64().unwrap(), d);
    }

    let doc32 = by_i[&32];
    assert!(!doc32.reduced);
    let doc32_json: serde_json::Value = serde_json::from_slice(&doc32.document).unwrap();
    assert_eq!(doc32_json["s"], serde_json::json!(["one", "four"]));

    let doc42 = by_i[&42];
    assert!(doc42.reduced);
    let doc42_json: serde_json::Value = serde_json::from_slice(&doc42.document).unwrap();
    assert_eq!(doc42_json["s"], serde_json::json!(["two", "three"]));

    combine.destroy();
}

// S8: derive handshake. A transaction with one plain document and one
// lambda-invoked document; flush_transaction drives the trampoline to
// completion, and the committed checkpoint reflects both.
#[tokio::test]
async fn s8_derive_handshake_drives_lambda_to_completion() {
    // SAFETY: `derive_vtable` matches the fixture's ABI.
    let service = unsafe { Service::create(derive_vtable(), 0, |_log: ops::Log| {}).unwrap() };
    let mut derive = flow_bridge::handshakes::derive::Derive::new(service);

    derive.register(
        native_fixtures::derive::code::INVOKE_LAMBDA,
        |payload: &[u8], _cancel: CancellationToken| {
            let upper = String::from_utf8_lossy(payload).to_uppercase();
            async move {
                let mut body = vec![0u8; flow_bridge::trampoline::REPLY_HEADER_LEN];
                body.extend_from_slice(upper.trim_matches('"').as_bytes());
                Ok(body)
            }
        },
    );

    derive.configure(&RawBytes(Vec::new())).unwrap();

    // No checkpoint has been committed yet.
    assert!(derive.restore_checkpoint().unwrap().is_empty());

    derive.begin_transaction().unwrap();
    derive
        .add_document(serde_json::json!({"key": "a", "lambda": false, "value": "kept"}).to_string().as_bytes())
        .unwrap();
    derive
        .add_document(
            serde_json::json!({"key": "b", "lambda": true, "value": "touppercase"})
                .to_string()
                .as_bytes(),
        )
        .unwrap();

    derive.flush_transaction().await.unwrap();

    let committed = derive.prepare_to_commit().unwrap();
    let committed: serde_json::Value = serde_json::from_slice(&committed).unwrap();
    assert_eq!(committed["a"], "kept");
    assert_eq!(committed["b"], "TOUPPERCASE");

    derive.clear_registers().unwrap();
    derive.destroy().await;
}
