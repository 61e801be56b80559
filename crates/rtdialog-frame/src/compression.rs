//! Gzip payload compression.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{FrameError, Result};

/// Gzip-compress a payload.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2 + 32),
        flate2::Compression::fast(),
    );
    encoder
        .write_all(data)
        .map_err(|e| FrameError::Compression(format!("gzip write failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| FrameError::Compression(format!("gzip finish failed: {e}")))
}

/// Gzip-decompress a payload, refusing output larger than `max` bytes.
pub fn gunzip(data: &[u8], max: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // Read one byte past the limit so an oversized stream is detectable.
    let limit = (max as u64).saturating_add(1);
    GzDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Compression(format!("gzip read failed: {e}")))?;

    if out.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: out.len(),
            max,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"{\"content\":\"hello hello hello hello\"}".repeat(8);
        let packed = gzip(&data).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&packed, 1024).unwrap(), data);
    }

    #[test]
    fn test_gunzip_enforces_limit() {
        let data = vec![0u8; 4096];
        let packed = gzip(&data).unwrap();
        let err = gunzip(&packed, 1024).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { max: 1024, .. }));
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let err = gunzip(b"not gzip at all", 1024).unwrap_err();
        assert!(matches!(err, FrameError::Compression(_)));
    }
}
