//! Build workflow handshake: `BEGIN` a catalog build, then drive the
//! trampoline polling loop until `DONE`/`DONE_WITH_ERRORS`. Grounded on
//! `crates/build/src/api.rs`'s `State`/`Code` state machine -- the same
//! `TRAMPOLINE` code is emitted by the native side to request host work and
//! accepted back as an input frame carrying the resolved reply.

use crate::service::Service;
use crate::trampoline::{drain_resolutions, Handler, TrampolineServer};

pub mod code {
    pub const BEGIN: u32 = 0;
    pub const POLL: u32 = 1;
    pub const TRAMPOLINE: u32 = 2;
    pub const DONE: u32 = 3;
    pub const DONE_WITH_ERRORS: u32 = 4;
    pub const CATALOG_SCHEMA: u32 = 5;
}

/// Trampoline task codes the build workflow registers handlers for.
pub mod task_code {
    pub const FETCH: u32 = 0;
    pub const VALIDATE_CAPTURE: u32 = 1;
    pub const VALIDATE_MATERIALIZATION: u32 = 2;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] crate::service::Error),
    #[error("build handshake saw an unrecognized output code {0}")]
    UnrecognizedCode(u32),
}

/// How a build terminated: user-visible errors loaded from the build
/// artifact are not a channel error, per SPEC_FULL.md §7's distinction
/// between infrastructure failures and `DONE_WITH_ERRORS`.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    DoneWithErrors,
}

pub struct Build {
    service: Service,
    trampoline: TrampolineServer,
}

impl Build {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            trampoline: TrampolineServer::new(),
        }
    }

    /// Register a handler for one of this workflow's trampoline task
    /// codes (see [`task_code`]), e.g. an HTTP-fetching [`Handler`] for
    /// [`task_code::FETCH`].
    pub fn register(&mut self, code: u32, handler: impl Handler) {
        self.trampoline.register(code, handler);
    }

    /// Request the native side's JSON catalog schema. Only valid before
    /// `run` -- a one-shot request/response with no further state
    /// transition (SPEC_FULL.md §10's supplemented op-code).
    pub fn catalog_schema(&mut self) -> Result<Vec<u8>, Error> {
        // SAFETY: empty payload, no pointer to keep alive.
        unsafe { self.service.enqueue_bytes(code::CATALOG_SCHEMA, &[]) };
        let out = self.service.poll()?;
        match out.out.first() {
            Some(frame) if frame.code == code::CATALOG_SCHEMA => Ok(out.bytes(frame).to_vec()),
            Some(frame) => Err(Error::UnrecognizedCode(frame.code)),
            None => Err(Error::UnrecognizedCode(0)),
        }
    }

    /// Begin the build and drive it to completion, dispatching trampoline
    /// requests to registered handlers as they arrive.
    pub async fn run<M: prost::Message>(&mut self, config: &M) -> Result<Outcome, Error> {
        self.service.enqueue_message(code::BEGIN, config);
        let mut pending_replies: Vec<crate::trampoline::Reply> = Vec::new();

        loop {
            // SAFETY: poll frame has no payload.
            unsafe { self.service.enqueue_bytes(code::POLL, &[]) };
            for reply in pending_replies.drain(..) {
                self.service
                    .enqueue_owned_bytes(code::TRAMPOLINE, &reply.body);
            }

            let out = self.service.poll()?;
            let mut dispatched = false;

            for frame in out.out {
                match frame.code {
                    code::DONE => return Ok(Outcome::Done),
                    code::DONE_WITH_ERRORS => return Ok(Outcome::DoneWithErrors),
                    code::TRAMPOLINE => {
                        self.trampoline.start_task(out.bytes(frame));
                        dispatched = true;
                    }
                    other => return Err(Error::UnrecognizedCode(other)),
                }
            }

            if dispatched || !self.trampoline.is_empty() {
                pending_replies = drain_resolutions(&mut self.trampoline).await;
            }
        }
    }

    pub async fn destroy(mut self) {
        self.trampoline.stop().await;
        self.service.destroy();
    }
}

/// A [`Handler`] that performs an HTTP GET and returns the response body,
/// for [`task_code::FETCH`].
pub struct FetchHandler {
    client: reqwest::Client,
}

impl FetchHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Handler for FetchHandler {
    fn start(
        &self,
        payload: &[u8],
        _cancel: tokio_util::sync::CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, String>> + Send>> {
        let url = String::from_utf8_lossy(payload).into_owned();
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|err| err.to_string())?;
            let mut body = vec![0u8; crate::trampoline::REPLY_HEADER_LEN];
            body.extend_from_slice(
                &response
                    .bytes()
                    .await
                    .map_err(|err| err.to_string())?,
            );
            Ok(body)
        })
    }
}
