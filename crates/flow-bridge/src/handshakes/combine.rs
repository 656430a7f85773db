//! Combine workflow handshake: reduce and combine keyed documents, then
//! drain them as `(document, key, fields)` triples plus a trailing stats
//! frame. Op-codes and drain shape grounded on
//! `crates/derive/src/combine_api.rs` and exercised in this workspace by
//! `native_fixtures::combine`.

use crate::service::{Output, Service};

pub mod code {
    pub const CONFIGURE: u32 = 0;
    pub const REDUCE_LEFT: u32 = 1;
    pub const COMBINE_RIGHT: u32 = 2;
    pub const DRAIN: u32 = 3;

    pub const DRAINED_REDUCED_DOCUMENT: u32 = 10;
    pub const DRAINED_COMBINED_DOCUMENT: u32 = 11;
    pub const DRAINED_KEY: u32 = 12;
    pub const DRAINED_FIELDS: u32 = 13;
    pub const DRAINED_STATS: u32 = 14;
}

/// Auto-flush threshold: `reduce_left`/`combine_right` invoke a bare `poll`
/// (asserting it produces no output) once this many documents have been
/// queued, so a long-running combine never accumulates an unbounded input
/// batch before the caller gets around to calling `drain`.
const FLUSH_THRESHOLD: usize = 128;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] crate::service::Error),
    #[error("combine handshake expected no output from an implicit flush, got {0} frames")]
    UnexpectedFlushOutput(usize),
    #[error("combine drain output is not a multiple of 3 plus a trailing stats frame: {0} frames")]
    MalformedDrain(usize),
}

/// One drained document: its body, packed key tuple, and packed fields
/// tuple, tagged with whether it was fully reduced or only combined.
pub struct Drained {
    pub reduced: bool,
    pub document: Vec<u8>,
    pub key: Vec<u8>,
    pub fields: Vec<u8>,
}

/// A combine workflow bound to one native channel. `configure` must be
/// called exactly once before `reduce_left`/`combine_right`/`drain`.
pub struct Combine {
    service: Service,
    queued: usize,
}

impl Combine {
    pub fn new(service: Service) -> Self {
        Self { service, queued: 0 }
    }

    /// Send `CONFIGURE` with the encoded collection key/field pointers.
    /// Expects no output. `config` is the service-defined configuration
    /// payload (e.g. collection key/field JSON pointers) -- its encoding is
    /// an external contract of the native service, not fixed by this
    /// bridge.
    pub fn configure(&mut self, config: &[u8]) -> Result<(), Error> {
        self.service.enqueue_owned_bytes(code::CONFIGURE, config);
        let out = self.service.poll()?;
        if !out.out.is_empty() {
            return Err(Error::UnexpectedFlushOutput(out.out.len()));
        }
        Ok(())
    }

    /// Enqueue a left-hand (to be reduced) document. Copied into the
    /// service's pinning buffer rather than referenced in place: unlike
    /// `drain`'s immediately-polled frame, this one may sit queued until
    /// the flush threshold or a later `drain`, well past the lifetime of
    /// a caller's temporary buffer.
    pub fn reduce_left(&mut self, doc: &[u8]) -> Result<(), Error> {
        self.service.enqueue_owned_bytes(code::REDUCE_LEFT, doc);
        self.maybe_flush()
    }

    /// Enqueue a right-hand (to be combined) document.
    pub fn combine_right(&mut self, doc: &[u8]) -> Result<(), Error> {
        self.service.enqueue_owned_bytes(code::COMBINE_RIGHT, doc);
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<(), Error> {
        self.queued += 1;
        if self.queued < FLUSH_THRESHOLD {
            return Ok(());
        }
        self.queued = 0;
        let out = self.service.poll()?;
        if !out.out.is_empty() {
            return Err(Error::UnexpectedFlushOutput(out.out.len()));
        }
        Ok(())
    }

    /// Send `DRAIN` and collect the resulting triples plus trailing stats
    /// frame.
    pub fn drain(&mut self) -> Result<(Vec<Drained>, Vec<u8>), Error> {
        // SAFETY: the payload is empty (`DRAIN` carries no body), so there
        // is no pointer to keep alive across the call.
        unsafe { self.service.enqueue_bytes(code::DRAIN, &[]) };
        self.queued = 0;
        let out = self.service.poll()?;
        parse_drain(&out)
    }

    pub fn destroy(self) {
        self.service.destroy();
    }
}

fn parse_drain(out: &Output<'_>) -> Result<(Vec<Drained>, Vec<u8>), Error> {
    if out.out.is_empty() || (out.out.len() - 1) % 3 != 0 {
        return Err(Error::MalformedDrain(out.out.len()));
    }
    let (triples, stats) = out.out.split_at(out.out.len() - 1);
    let stats = out.bytes(&stats[0]).to_vec();

    let mut drained = Vec::with_capacity(triples.len() / 3);
    for chunk in triples.chunks_exact(3) {
        let [doc, key, fields] = chunk else {
            unreachable!("chunks_exact(3) always yields 3 elements")
        };
        let reduced = match doc.code {
            code::DRAINED_REDUCED_DOCUMENT => true,
            code::DRAINED_COMBINED_DOCUMENT => false,
            other => return Err(Error::MalformedDrain(other as usize)),
        };
        drained.push(Drained {
            reduced,
            document: out.bytes(doc).to_vec(),
            key: out.bytes(key).to_vec(),
            fields: out.bytes(fields).to_vec(),
        });
    }
    Ok((drained, stats))
}
