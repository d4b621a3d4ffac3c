//! Streaming compressed upload
//!
//! Wires a source tool's stdout through a byte counter into an lz4
//! child, and the compressor's stdout into the multipart uploader in
//! part-sized chunks. The object is only completed after every child
//! has exited cleanly; a truncated stream must never complete into a
//! valid-looking object. Cancellation aborts the multipart upload
//! before the children are torn down.

use crate::progress::{ByteCounter, CountingReader};
use crate::{CoreError, Result};
use bytes::{Bytes, BytesMut};
use snapferry_proc::{FailureFlag, Tool, ToolChild};
use snapferry_store::{ObjectStore, PutParams};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Pipe `source`'s stdout through lz4 into a multipart upload.
///
/// Returns the uncompressed byte count that passed the counter.
pub async fn upload_from_tool(
    store: &ObjectStore,
    params: PutParams,
    mut source: ToolChild,
    counter: &ByteCounter,
    compression_level: u32,
    flag: &FailureFlag,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut lz4 = Tool::new(
        "lz4",
        ["-z".to_string(), format!("-{compression_level}"), "-c".to_string()],
    )
    .spawn_filter(flag)?;

    let source_stdout = source.take_stdout().ok_or_else(|| {
        CoreError::Pipeline(format!("{} produced no stdout", source.name()))
    })?;
    let mut lz4_stdin = lz4
        .take_stdin()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdin unavailable".to_string()))?;
    let mut lz4_stdout = lz4
        .take_stdout()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdout unavailable".to_string()))?;

    let pump_counter = counter.clone();
    let pump = tokio::spawn(async move {
        let mut reader = CountingReader::new(source_stdout, pump_counter);
        let result = tokio::io::copy(&mut reader, &mut lz4_stdin).await;
        drop(lz4_stdin);
        result
    });

    let mut upload = store.start_upload(params).await?;
    let part_size = upload.part_size() as usize;

    let streamed: Result<()> = async {
        loop {
            let (part, eof) = read_part(&mut lz4_stdout, part_size, cancel).await?;
            if !part.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Interrupted),
                    put = upload.put_part(part) => put?,
                }
            }
            if eof {
                break;
            }
        }
        let copied = pump
            .await
            .map_err(|e| CoreError::Pipeline(format!("stream pump died: {e}")))?;
        copied?;
        source.wait().await?;
        lz4.wait().await?;
        Ok(())
    }
    .await;

    match streamed {
        Ok(()) => {
            upload.finish().await?;
            Ok(counter.total())
        }
        Err(err) => {
            source.start_kill();
            lz4.start_kill();
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!("multipart abort after pipeline failure also failed: {abort_err}");
            }
            Err(err)
        }
    }
}

/// Total size of all regular files under a directory, via `du -sb`
pub async fn recursive_size(path: &std::path::Path) -> Result<u64> {
    let out =
        snapferry_proc::run_tool("du", ["-sb".to_string(), path.display().to_string()]).await?;
    out.split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CoreError::Pipeline(format!("unparseable du output: {out:?}")))
}

/// Cancel `cancel` when an interrupt arrives.
///
/// One watcher per upload; aborted once the upload settles so later
/// interrupts fall through to default process termination.
pub fn interrupt_guard(cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting upload");
            cancel.cancel();
        }
    })
}

/// Read one part (up to `part_size` bytes) or return early on
/// cancellation. The bool is true at end of stream.
async fn read_part<R: AsyncRead + Unpin>(
    reader: &mut R,
    part_size: usize,
    cancel: &CancellationToken,
) -> Result<(Bytes, bool)> {
    let mut buf = BytesMut::with_capacity(part_size);
    while buf.len() < part_size {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Interrupted),
            read = reader.read_buf(&mut buf) => read?,
        };
        if n == 0 {
            return Ok((buf.freeze(), true));
        }
    }
    Ok((buf.freeze(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_part_fills_to_part_size() {
        let cancel = CancellationToken::new();
        let mut reader = Cursor::new(vec![9u8; 10]);
        let (part, eof) = read_part(&mut reader, 4, &cancel).await.unwrap();
        assert_eq!(part.len(), 4);
        assert!(!eof);
        let (part, eof) = read_part(&mut reader, 4, &cancel).await.unwrap();
        assert_eq!(part.len(), 4);
        assert!(!eof);
        let (part, eof) = read_part(&mut reader, 4, &cancel).await.unwrap();
        assert_eq!(part.len(), 2);
        assert!(eof);
    }

    #[tokio::test]
    async fn test_read_part_empty_stream() {
        let cancel = CancellationToken::new();
        let mut reader = Cursor::new(Vec::<u8>::new());
        let (part, eof) = read_part(&mut reader, 4, &cancel).await.unwrap();
        assert!(part.is_empty());
        assert!(eof);
    }

    #[tokio::test]
    async fn test_read_part_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // A pending reader never resolves; cancellation must win.
        let (_write_half, mut pending) = tokio::io::duplex(16);
        let result = read_part(&mut pending, 4, &cancel).await;
        assert!(matches!(result, Err(CoreError::Interrupted)));
    }
}
