//! Raw DEFLATE stream transform

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Write;

use crate::providers::DriveError;

pub const COMPRESSION_TRANSFORM_NAME: &str = "deflate";

/// Streaming DEFLATE. Clones keep the level but start a fresh stream.
pub struct DeflateTransform {
    level: u32,
    encoder: Option<DeflateEncoder<Vec<u8>>>,
    decoder: Option<DeflateDecoder<Vec<u8>>>,
}

impl Default for DeflateTransform {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Clone for DeflateTransform {
    fn clone(&self) -> Self {
        Self::new(self.level)
    }
}

impl DeflateTransform {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
            encoder: None,
            decoder: None,
        }
    }

    pub fn reset(&mut self) {
        self.encoder = None;
        self.decoder = None;
    }

    pub fn encode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let level = self.level;
        let encoder = self
            .encoder
            .get_or_insert_with(|| DeflateEncoder::new(Vec::new(), Compression::new(level)));
        encoder
            .write_all(chunk)
            .map_err(|e| DriveError::TransformFailed(format!("deflate: {}", e)))?;
        if is_last {
            encoder
                .try_finish()
                .map_err(|e| DriveError::TransformFailed(format!("deflate finish: {}", e)))?;
        }
        Ok(std::mem::take(encoder.get_mut()))
    }

    pub fn decode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let decoder = self
            .decoder
            .get_or_insert_with(|| DeflateDecoder::new(Vec::new()));
        decoder
            .write_all(chunk)
            .map_err(|e| DriveError::Integrity(format!("Corrupt deflate stream: {}", e)))?;
        if is_last {
            decoder
                .try_finish()
                .map_err(|e| DriveError::Integrity(format!("Corrupt deflate stream: {}", e)))?;
        }
        Ok(std::mem::take(decoder.get_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_compresses() {
        let data = b"the quick brown fox ".repeat(2_000);
        let mut t = DeflateTransform::default();
        let mut encoded = Vec::new();
        for piece in data.chunks(1_000) {
            encoded.extend(t.encode(piece, false).unwrap());
        }
        encoded.extend(t.encode(&[], true).unwrap());
        assert!(encoded.len() < data.len() / 10);

        let mut d = DeflateTransform::default();
        let mut decoded = Vec::new();
        let pieces: Vec<&[u8]> = encoded.chunks(17).collect();
        for (i, piece) in pieces.iter().enumerate() {
            decoded.extend(d.decode(piece, i == pieces.len() - 1).unwrap());
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut d = DeflateTransform::default();
        let result = d
            .decode(&[0xff; 64], false)
            .and_then(|_| d.decode(&[], true));
        assert!(result.is_err());
    }
}
