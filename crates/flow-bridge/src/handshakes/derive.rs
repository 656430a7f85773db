//! Derive workflow handshake: the combine pattern plus trampoline-invoked
//! lambdas. `FLUSH_TRANSACTION` may interleave task starts with the single
//! `FLUSHED_TRANSACTION` sentinel; it completes only once every dispatched
//! task has a reply *and* the sentinel has been observed -- mirroring the
//! shared trampoline polling loop (SPEC_FULL.md §4.2, §4.4).

use crate::service::Service;
use crate::trampoline::{drain_resolutions, Handler, TrampolineServer};

pub mod code {
    pub const CONFIGURE: u32 = 0;
    pub const BEGIN_TRANSACTION: u32 = 1;
    pub const ADD_DOCUMENT: u32 = 2;
    pub const FLUSH_TRANSACTION: u32 = 3;
    pub const PREPARE_TO_COMMIT: u32 = 4;
    pub const RESTORE_CHECKPOINT: u32 = 5;
    pub const CLEAR_REGISTERS: u32 = 6;

    pub const TRAMPOLINE_INVOKE: u32 = 20;
    pub const FLUSHED_TRANSACTION: u32 = 21;
}

/// Trampoline task codes the derive workflow registers lambda-invocation
/// handlers under.
pub mod task_code {
    pub const INVOKE_LAMBDA: u32 = 0;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] crate::service::Error),
    #[error("derive handshake saw an unrecognized output code {0}")]
    UnrecognizedCode(u32),
    #[error("derive handshake expected no output from {0:?}, got {1} frames")]
    UnexpectedOutput(&'static str, usize),
}

pub struct Derive {
    service: Service,
    trampoline: TrampolineServer,
}

impl Derive {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            trampoline: TrampolineServer::new(),
        }
    }

    pub fn register(&mut self, code: u32, handler: impl Handler) {
        self.trampoline.register(code, handler);
    }

    fn round_trip(&mut self, code: u32, label: &'static str) -> Result<(), Error> {
        // SAFETY: every caller of `round_trip` sends an empty payload.
        unsafe { self.service.enqueue_bytes(code, &[]) };
        let out = self.service.poll()?;
        if !out.out.is_empty() {
            return Err(Error::UnexpectedOutput(label, out.out.len()));
        }
        Ok(())
    }

    pub fn configure<M: prost::Message>(&mut self, config: &M) -> Result<(), Error> {
        self.service.enqueue_message(code::CONFIGURE, config);
        let out = self.service.poll()?;
        if !out.out.is_empty() {
            return Err(Error::UnexpectedOutput("configure", out.out.len()));
        }
        Ok(())
    }

    pub fn begin_transaction(&mut self) -> Result<(), Error> {
        self.round_trip(code::BEGIN_TRANSACTION, "begin_transaction")
    }

    pub fn restore_checkpoint(&mut self) -> Result<Vec<u8>, Error> {
        // SAFETY: empty payload.
        unsafe { self.service.enqueue_bytes(code::RESTORE_CHECKPOINT, &[]) };
        let out = self.service.poll()?;
        match out.out.first() {
            Some(frame) => Ok(out.bytes(frame).to_vec()),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear_registers(&mut self) -> Result<(), Error> {
        self.round_trip(code::CLEAR_REGISTERS, "clear_registers")
    }

    pub fn add_document(&mut self, doc: &[u8]) -> Result<(), Error> {
        // SAFETY: `doc` is borrowed only for the duration of this call.
        unsafe { self.service.enqueue_bytes(code::ADD_DOCUMENT, doc) };
        let out = self.service.poll()?;
        // Each added document may itself trigger a lambda invocation.
        for frame in out.out {
            match frame.code {
                code::TRAMPOLINE_INVOKE => self.trampoline.start_task(out.bytes(frame)),
                other => return Err(Error::UnrecognizedCode(other)),
            }
        }
        Ok(())
    }

    /// Flush the in-progress transaction, draining lambda invocations and
    /// their replies until the native side reports the sentinel and no
    /// task remains outstanding.
    pub async fn flush_transaction(&mut self) -> Result<(), Error> {
        let mut sentinel_seen = false;
        let mut pending_replies: Vec<crate::trampoline::Reply> = Vec::new();
        let mut sent_flush = false;

        loop {
            if !sent_flush {
                // SAFETY: empty payload.
                unsafe { self.service.enqueue_bytes(code::FLUSH_TRANSACTION, &[]) };
                sent_flush = true;
            }
            for reply in pending_replies.drain(..) {
                self.service
                    .enqueue_owned_bytes(code::TRAMPOLINE_INVOKE, &reply.body);
            }

            let out = self.service.poll()?;
            for frame in out.out {
                match frame.code {
                    code::TRAMPOLINE_INVOKE => self.trampoline.start_task(out.bytes(frame)),
                    code::FLUSHED_TRANSACTION => sentinel_seen = true,
                    other => return Err(Error::UnrecognizedCode(other)),
                }
            }

            if sentinel_seen && self.trampoline.is_empty() {
                return Ok(());
            }
            pending_replies = drain_resolutions(&mut self.trampoline).await;
        }
    }

    pub fn prepare_to_commit(&mut self) -> Result<Vec<u8>, Error> {
        // SAFETY: empty payload.
        unsafe { self.service.enqueue_bytes(code::PREPARE_TO_COMMIT, &[]) };
        let out = self.service.poll()?;
        match out.out.first() {
            Some(frame) => Ok(out.bytes(frame).to_vec()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn destroy(mut self) {
        self.trampoline.stop().await;
        self.service.destroy();
    }
}

