//! The trampoline: lets the native side request asynchronous host work
//! (HTTP fetches, connector validation, lambda invocation) without blocking
//! the channel. The native side emits a "start task" output frame; we
//! dispatch it to a registered handler running on the host's async
//! runtime, then feed the handler's reply back as an input frame.
//!
//! Wire format (SPEC_FULL.md §4.2): a request is
//! `task_id:u64le || task_code:u32le || payload`; a reply is
//! `task_id:u64le || ok:u8 || body`. The 9-byte reply header is reserved by
//! convention -- handlers build their response with it pre-allocated and
//! the dispatcher fills it in.

use bytes::Buf;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Length, in bytes, of the reply header every handler must reserve:
/// `task_id:u64le || status:u8`.
pub const REPLY_HEADER_LEN: usize = 9;

/// A decoded "start task" request, sliced out of an output frame's payload.
pub struct Request<'a> {
    pub task_id: u64,
    pub task_code: u32,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parse `task_id:u64le || task_code:u32le || payload` out of `data`.
    pub fn decode(mut data: &'a [u8]) -> Self {
        let task_id = data.get_u64_le();
        let task_code = data.get_u32_le();
        Request {
            task_id,
            task_code,
            payload: data,
        }
    }
}

/// A resolved task reply ready to be enqueued as an input frame:
/// `task_id:u64le || ok:u8 || body`.
pub struct Reply {
    pub task_id: u64,
    pub body: Vec<u8>,
}

impl Reply {
    fn ok(task_id: u64, body: Vec<u8>) -> Self {
        debug_assert!(body.len() >= REPLY_HEADER_LEN);
        let mut body = body;
        body[0..8].copy_from_slice(&task_id.to_le_bytes());
        body[8] = 1;
        Self { task_id, body }
    }

    fn err(task_id: u64, message: &str) -> Self {
        let mut body = Vec::with_capacity(REPLY_HEADER_LEN + message.len());
        body.extend_from_slice(&task_id.to_le_bytes());
        body.push(0);
        body.extend_from_slice(message.as_bytes());
        Self { task_id, body }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered handler for one `task_code`: `decode` runs synchronously
/// against the native-owned payload (so it never outlives `start_task`),
/// and `execute` runs asynchronously to produce the reply body (with the
/// 9-byte header already reserved) or an error message.
pub trait Handler: Send + Sync + 'static {
    /// Parse `payload` into an owned, 'static value and begin executing it.
    /// `payload` must not be retained past this call -- only its decoded
    /// output may cross into `execute`'s future.
    fn start(
        &self,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> BoxFuture<Result<Vec<u8>, String>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(&[u8], CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
{
    fn start(
        &self,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> BoxFuture<Result<Vec<u8>, String>> {
        Box::pin(self(payload, cancel))
    }
}

/// Dispatches "start task" requests from the native side to registered
/// [`Handler`]s, and collects their replies for the owning loop to drain.
pub struct TrampolineServer {
    handlers: HashMap<u32, Arc<dyn Handler>>,
    cancel: CancellationToken,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: mpsc::UnboundedReceiver<Reply>,
    outstanding: usize,
    joins: tokio::task::JoinSet<()>,
}

impl TrampolineServer {
    pub fn new() -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            handlers: HashMap::new(),
            cancel: CancellationToken::new(),
            replies_tx,
            replies_rx,
            outstanding: 0,
            joins: tokio::task::JoinSet::new(),
        }
    }

    /// Register a handler for `task_code`. Registering a second handler for
    /// the same code replaces the first.
    pub fn register(&mut self, task_code: u32, handler: impl Handler) {
        self.handlers.insert(task_code, Arc::new(handler));
    }

    /// True if no task is currently outstanding (started but not yet
    /// replied to).
    pub fn is_empty(&self) -> bool {
        self.outstanding == 0
    }

    /// Handle a "start task" output frame: decode the request, look up its
    /// handler, and spawn asynchronous execution. Even an unknown
    /// `task_code` or a handler that panics still produces exactly one
    /// reply, so the native side is never left blocked on a task id that
    /// will never resolve.
    pub fn start_task(&mut self, request: &[u8]) {
        let Request {
            task_id,
            task_code,
            payload,
        } = Request::decode(request);

        self.outstanding += 1;
        let replies_tx = self.replies_tx.clone();
        let cancel = self.cancel.clone();

        match self.handlers.get(&task_code) {
            Some(handler) => {
                let handler = handler.clone();
                // `execute` must run against `payload` decoded now (we're
                // still inside the synchronous `start_task` call, with a
                // live borrow of the native arena); `Handler::start` is
                // responsible for not retaining it past this call.
                let future = handler.start(payload, cancel.clone());
                self.joins.spawn(async move {
                    let reply = match future.await {
                        Ok(body) => Reply::ok(task_id, body),
                        Err(message) => Reply::err(task_id, &message),
                    };
                    let _ = replies_tx.send(reply);
                });
            }
            None => {
                let reply = Reply::err(task_id, &format!("no handler for task_code {task_code}"));
                let _ = replies_tx.send(reply);
            }
        }
    }

    /// Record that a reply has been drained into the channel.
    fn mark_replied(&mut self) {
        self.outstanding -= 1;
    }

    /// Non-blocking: take a reply if one is already available.
    pub fn try_recv(&mut self) -> Option<Reply> {
        match self.replies_rx.try_recv() {
            Ok(reply) => {
                self.mark_replied();
                Some(reply)
            }
            Err(_) => None,
        }
    }

    /// Block until a reply is available. Panics if no task is outstanding
    /// and none will ever arrive -- callers must check `is_empty()` first.
    pub async fn recv(&mut self) -> Reply {
        let reply = self
            .replies_rx
            .recv()
            .await
            .expect("replies_tx is held by self and never dropped while outstanding > 0");
        self.mark_replied();
        reply
    }

    /// Cancel every handler's context and wait for all in-flight spawns to
    /// complete. Every outstanding task is guaranteed to still produce a
    /// reply (handlers are required to finish quickly on cancellation, not
    /// abandon their reply), so after `stop()` returns, draining
    /// `try_recv()` until empty yields every remaining reply.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        while self.joins.join_next().await.is_some() {}
    }
}

impl Default for TrampolineServer {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared "trampoline polling loop" (SPEC_FULL.md §4.2): collect every
/// reply that is already resolved; if none were ready and at least one task
/// is still outstanding, block for the next one (then opportunistically
/// drain any further ones that resolved in the meantime). Callers enqueue
/// the returned replies as `TRAMPOLINE`-coded input frames *before* any
/// bare "poll" marker frame in the same batch, satisfying the rule that all
/// available resolutions are sent before the channel is polled again.
pub async fn drain_resolutions(trampoline: &mut TrampolineServer) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Some(reply) = trampoline.try_recv() {
        replies.push(reply);
    }
    if replies.is_empty() && !trampoline.is_empty() {
        replies.push(trampoline.recv().await);
        while let Some(reply) = trampoline.try_recv() {
            replies.push(reply);
        }
    }
    replies
}
