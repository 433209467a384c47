//! SHA-256 content checksums.
//!
//! Checksums are lowercase hex and double as content-addressed storage keys.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_LEN: usize = 64;

/// Buffer size for streaming reads.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 over a byte stream.
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Sha256,
    bytes: u64,
}

impl Checksum {
    /// Start an empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the stream.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksum")
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Checksum of an in-memory buffer.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stream `reader` to the end, returning its checksum and length.
pub async fn checksum_reader<R>(reader: &mut R) -> std::io::Result<(String, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut checksum = Checksum::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        checksum.update(&buf[..n]);
    }
    let len = checksum.bytes_hashed();
    Ok((checksum.finalize(), len))
}

/// Whether `s` looks like a checksum produced by this module.
pub fn is_valid_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_digests() {
        assert_eq!(checksum_hex(b""), EMPTY_SHA256);
        assert_eq!(checksum_hex(b"abc"), ABC_SHA256);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut checksum = Checksum::new();
        for part in data.chunks(333) {
            checksum.update(part);
        }
        assert_eq!(checksum.bytes_hashed(), data.len() as u64);
        assert_eq!(checksum.finalize(), checksum_hex(&data));
    }

    #[tokio::test]
    async fn test_checksum_reader() {
        let data = vec![7u8; READ_BUFFER_SIZE * 2 + 17];
        let mut reader = &data[..];

        let (sum, len) = checksum_reader(&mut reader).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(sum, checksum_hex(&data));
    }

    #[test]
    fn test_is_valid_checksum() {
        assert!(is_valid_checksum(ABC_SHA256));
        assert!(!is_valid_checksum(&ABC_SHA256.to_uppercase()));
        assert!(!is_valid_checksum("abc"));
        assert!(!is_valid_checksum(&"g".repeat(CHECKSUM_LEN)));
    }
}
