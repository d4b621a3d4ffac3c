//! Per-file hashing of a tar byte stream
//!
//! Tar output is not canonical across producers, so the archive is
//! never hashed as a whole. Instead every regular-file entry is hashed
//! as it streams past, without materializing the archive anywhere.

use crate::{md5_read, HashError, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

/// Hash every regular file in a tar stream.
///
/// Writes one `<md5>  <path>` line per regular-file entry to `out` and
/// returns the number of lines written. Entry paths are normalized
/// (leading `./` stripped) so they compare against a directory walk of
/// the same tree.
pub async fn tar_entry_hashes<R>(reader: R, out: &Path) -> Result<u64>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(reader);
    let out = out.to_path_buf();
    tokio::task::spawn_blocking(move || hash_tar(bridge, &out))
        .await
        .map_err(|e| HashError::Task(e.to_string()))?
}

fn hash_tar<R: Read>(reader: R, out: &PathBuf) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    let mut writer = BufWriter::new(File::create(out)?);
    let mut count = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = match normalize_entry_path(&entry.path()?) {
            Some(path) => path,
            None => continue,
        };
        let digest = md5_read(&mut entry)?;
        writeln!(writer, "{digest}  {path}")?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Strip the `./` prefix tar writes for cwd-relative archives.
/// Returns `None` for the bare `.` root entry.
pub(crate) fn normalize_entry_path(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    let text = text.strip_prefix("./").unwrap_or(&text);
    let text = text.trim_end_matches('/');
    if text.is_empty() || text == "." {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, Cursor::new(*data)).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_tar_entry_hashes_streams_regular_files() {
        let archive = build_tar(&[
            ("./alpha.txt", b"alpha contents".as_slice()),
            ("./sub/beta.bin", b"beta".as_slice()),
        ]);
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("remote.md5");

        let count = tar_entry_hashes(Cursor::new(archive), &out).await.unwrap();
        assert_eq!(count, 2);

        let listing = std::fs::read_to_string(&out).unwrap();
        let expected_alpha = format!("{:x}  alpha.txt", md5::compute(b"alpha contents"));
        let expected_beta = format!("{:x}  sub/beta.bin", md5::compute(b"beta"));
        assert!(listing.contains(&expected_alpha), "listing: {listing}");
        assert!(listing.contains(&expected_beta), "listing: {listing}");
    }

    #[tokio::test]
    async fn test_tar_entry_hashes_skips_directories() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "./sub/", Cursor::new(&b""[..]))
            .unwrap();
        let archive = builder.into_inner().unwrap();

        let temp = TempDir::new().unwrap();
        let out = temp.path().join("remote.md5");
        let count = tar_entry_hashes(Cursor::new(archive), &out).await.unwrap();
        assert_eq!(count, 0);
        assert!(std::fs::read_to_string(&out).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("./a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(
            normalize_entry_path(Path::new("plain.txt")).as_deref(),
            Some("plain.txt")
        );
        assert_eq!(normalize_entry_path(Path::new("./")), None);
        assert_eq!(normalize_entry_path(Path::new(".")), None);
    }
}
