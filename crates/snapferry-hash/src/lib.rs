//! Streaming MD5 hashing with bounded memory
//!
//! Hashes byte streams, every regular file inside a tar stream, and
//! every regular file under a directory tree, always reading in 1 MiB
//! chunks so memory stays flat regardless of input size. Hash lists use
//! the md5sum line format `<md5>  <path>` and compare order-independent
//! after sorting.

pub mod compare;
pub mod dir;
pub mod tar;

pub use compare::{compare_hash_lists, sort_hash_list, Comparison, HashDiff};
pub use dir::dir_entry_hashes;
pub use tar::tar_entry_hashes;

use std::io::Read;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result type for hashing operations
pub type Result<T> = std::result::Result<T, HashError>;

/// Errors from hashing and hash-list comparison
#[derive(Debug, Error)]
pub enum HashError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External tool failure (sort)
    #[error(transparent)]
    Proc(#[from] snapferry_proc::ProcError),

    /// Background hashing task died
    #[error("hashing task failed: {0}")]
    Task(String),

    /// A hash list line did not match `<md5>  <path>`
    #[error("malformed hash list line in {file}: {line:?}")]
    BadLine { file: String, line: String },
}

/// Read buffer size for all hashing paths (1 MiB)
const BUFFER_SIZE: usize = 1024 * 1024;

/// MD5 of an async byte stream, hex encoded
pub async fn md5_reader<R: AsyncRead + Unpin>(reader: R) -> Result<String> {
    md5_reader_counting(reader, |_| {}).await
}

/// MD5 of an async byte stream, reporting each chunk's size to `on_bytes`.
pub async fn md5_reader_counting<R, F>(mut reader: R, mut on_bytes: F) -> Result<String>
where
    R: AsyncRead + Unpin,
    F: FnMut(u64),
{
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
        on_bytes(n as u64);
    }
    Ok(format!("{:x}", context.compute()))
}

/// MD5 of a blocking reader, hex encoded
pub fn md5_read<R: Read>(mut reader: R) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_md5_reader_matches_known_digest() {
        // md5("abc") is a fixed vector
        let hash = md5_reader(Cursor::new(b"abc".to_vec())).await.unwrap();
        assert_eq!(hash, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_md5_reader_counting_reports_all_bytes() {
        let data = vec![7u8; 3 * 1024 * 1024 + 17];
        let mut counted = 0u64;
        let streamed = md5_reader_counting(Cursor::new(data.clone()), |n| counted += n)
            .await
            .unwrap();
        assert_eq!(counted, data.len() as u64);
        assert_eq!(streamed, format!("{:x}", md5::compute(&data)));
    }

    #[test]
    fn test_md5_read_sync_agrees_with_async() {
        let data = b"snapferry".to_vec();
        let sync = md5_read(Cursor::new(data.clone())).unwrap();
        assert_eq!(sync, format!("{:x}", md5::compute(&data)));
    }
}
