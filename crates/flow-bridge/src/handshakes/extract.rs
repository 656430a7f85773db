//! Extract workflow handshake: the simplest of the four. `CONFIGURE` once,
//! then `EXTRACT(doc)` per document; each document's `poll` yields exactly
//! two output frames, an `EXTRACTED_UUID` followed by a packed-fields
//! tuple.

use crate::service::Service;

pub mod code {
    pub const CONFIGURE: u32 = 0;
    pub const EXTRACT: u32 = 1;

    pub const EXTRACTED_UUID: u32 = 10;
    pub const EXTRACTED_FIELDS: u32 = 11;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] crate::service::Error),
    #[error("extract expected 2 output frames per document, got {0}")]
    UnexpectedOutputCount(usize),
    #[error("extract's first output frame had code {0}, expected EXTRACTED_UUID")]
    UnexpectedLeadCode(u32),
}

/// One extracted document: its UUID and packed field-value tuple.
pub struct Extracted {
    pub uuid: Vec<u8>,
    pub fields: Vec<u8>,
}

pub struct Extract {
    service: Service,
}

impl Extract {
    pub fn new(service: Service) -> Self {
        Self { service }
    }

    /// Send `CONFIGURE` with the encoded field pointers. Expects no output.
    pub fn configure(&mut self, config: &[u8]) -> Result<(), Error> {
        self.service.enqueue_owned_bytes(code::CONFIGURE, config);
        let out = self.service.poll()?;
        if !out.out.is_empty() {
            return Err(Error::UnexpectedOutputCount(out.out.len()));
        }
        Ok(())
    }

    /// Extract one document, returning its UUID and packed fields.
    pub fn extract(&mut self, doc: &[u8]) -> Result<Extracted, Error> {
        // SAFETY: `doc` is borrowed only for the duration of this call.
        unsafe { self.service.enqueue_bytes(code::EXTRACT, doc) };
        let out = self.service.poll()?;

        if out.out.len() != 2 {
            return Err(Error::UnexpectedOutputCount(out.out.len()));
        }
        if out.out[0].code != code::EXTRACTED_UUID {
            return Err(Error::UnexpectedLeadCode(out.out[0].code));
        }

        Ok(Extracted {
            uuid: out.bytes(&out.out[0]).to_vec(),
            fields: out.bytes(&out.out[1]).to_vec(),
        })
    }

    pub fn destroy(self) {
        self.service.destroy();
    }
}
