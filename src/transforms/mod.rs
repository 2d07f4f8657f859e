//! Reversible stream transforms
//!
//! A [`TransformPipeline`] is an ordered list of stateful transforms. Upload
//! encodes through them in order; download decodes in reverse, so
//! `[deflate, aes]` compresses then encrypts, and decrypts then inflates.
//! Each transfer works on its own copy obtained from
//! [`TransformPipeline::begin_session`].

pub mod compression;
pub mod encryption;

pub use compression::{DeflateTransform, COMPRESSION_TRANSFORM_NAME};
pub use encryption::{AesCtrTransform, EncryptionKey, ENCRYPTION_TRANSFORM_NAME};

use crate::providers::DriveError;

#[derive(Clone)]
pub enum StreamTransform {
    Encryption(AesCtrTransform),
    Compression(DeflateTransform),
}

impl StreamTransform {
    pub fn name(&self) -> &'static str {
        match self {
            StreamTransform::Encryption(_) => ENCRYPTION_TRANSFORM_NAME,
            StreamTransform::Compression(_) => COMPRESSION_TRANSFORM_NAME,
        }
    }

    pub fn reset(&mut self) {
        match self {
            StreamTransform::Encryption(t) => t.reset(),
            StreamTransform::Compression(t) => t.reset(),
        }
    }

    pub fn encode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        match self {
            StreamTransform::Encryption(t) => t.encode(chunk, is_last),
            StreamTransform::Compression(t) => t.encode(chunk, is_last),
        }
    }

    pub fn decode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        match self {
            StreamTransform::Encryption(t) => t.decode(chunk, is_last),
            StreamTransform::Compression(t) => t.decode(chunk, is_last),
        }
    }
}

impl std::fmt::Debug for StreamTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Default, Debug)]
pub struct TransformPipeline {
    transforms: Vec<StreamTransform>,
}

impl TransformPipeline {
    pub fn new(transforms: Vec<StreamTransform>) -> Self {
        Self { transforms }
    }

    pub fn with(mut self, transform: StreamTransform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.transforms.iter().map(|t| t.name().to_string()).collect()
    }

    /// Fresh copy with reset state for one file transfer
    pub fn begin_session(&self) -> Self {
        let mut session = self.clone();
        for transform in &mut session.transforms {
            transform.reset();
        }
        session
    }

    /// Like [`begin_session`](Self::begin_session), but encryption derives
    /// its IV from `nonce`: the same nonce and input give the same stream
    pub fn begin_deterministic_session(&self, nonce: &[u8]) -> Self {
        let mut session = self.begin_session();
        for transform in &mut session.transforms {
            if let StreamTransform::Encryption(t) = transform {
                t.reset_deterministic(nonce);
            }
        }
        session
    }

    pub fn has_encryption(&self) -> bool {
        self.transforms
            .iter()
            .any(|t| matches!(t, StreamTransform::Encryption(_)))
    }

    pub fn encode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let mut data = chunk.to_vec();
        for transform in self.transforms.iter_mut() {
            data = transform.encode(&data, is_last)?;
        }
        Ok(data)
    }

    pub fn decode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let mut data = chunk.to_vec();
        for transform in self.transforms.iter_mut().rev() {
            data = transform.decode(&data, is_last)?;
        }
        Ok(data)
    }

    /// A stored version can only be decoded by the pipeline that wrote it
    pub fn ensure_matches(&self, recorded: &[String]) -> Result<(), DriveError> {
        let names = self.names();
        if names.as_slice() != recorded {
            return Err(DriveError::Integrity(format!(
                "Version was written with transforms {:?}, configured pipeline is {:?}",
                recorded, names
            )));
        }
        Ok(())
    }
}
