//! Per-file hashing of a directory tree
//!
//! Produces the same `<md5>  <path>` line format as the tar-stream
//! hasher, with paths relative to the walk root, so the two sides of a
//! validation compare line for line once sorted.

use crate::{md5_read, HashError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Hash every regular file under `root`.
///
/// Writes one line per file to `out` and returns the number of lines;
/// `on_bytes` sees each file's size as it is hashed. Symlinks are not
/// followed; only regular files are hashed, matching what tar archiving
/// of the same tree records.
pub async fn dir_entry_hashes<F>(root: &Path, out: &Path, on_bytes: F) -> Result<u64>
where
    F: FnMut(u64) + Send + 'static,
{
    let root = root.to_path_buf();
    let out = out.to_path_buf();
    tokio::task::spawn_blocking(move || hash_dir(&root, &out, on_bytes))
        .await
        .map_err(|e| HashError::Task(e.to_string()))?
}

fn hash_dir<F: FnMut(u64)>(root: &PathBuf, out: &PathBuf, mut on_bytes: F) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(out)?);
    let mut count = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            HashError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        let digest = md5_read(BufReader::new(File::open(entry.path())?))?;
        writeln!(writer, "{digest}  {}", relative.display())?;
        on_bytes(entry.metadata().map(|m| m.len()).unwrap_or(0));
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dir_entry_hashes_walks_recursively() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("nested/deep")).unwrap();
        std::fs::write(tree.join("top.txt"), b"top").unwrap();
        std::fs::write(tree.join("nested/deep/leaf.bin"), b"leaf").unwrap();

        let out = temp.path().join("local.md5");
        let count = dir_entry_hashes(&tree, &out, |_| {}).await.unwrap();
        assert_eq!(count, 2);

        let listing = std::fs::read_to_string(&out).unwrap();
        assert!(listing.contains(&format!("{:x}  top.txt", md5::compute(b"top"))));
        assert!(listing.contains(&format!(
            "{:x}  nested/deep/leaf.bin",
            md5::compute(b"leaf")
        )));
    }

    #[tokio::test]
    async fn test_dir_entry_hashes_empty_dir() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir(&tree).unwrap();
        let out = temp.path().join("local.md5");
        let count = dir_entry_hashes(&tree, &out, |_| {}).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_dir_paths_match_tar_normalization() {
        // A file at a/b must hash to the same line a tar of the tree
        // produces after entry-path normalization.
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("a")).unwrap();
        std::fs::write(tree.join("a/b"), b"payload").unwrap();

        let out = temp.path().join("local.md5");
        dir_entry_hashes(&tree, &out, |_| {}).await.unwrap();
        let listing = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            listing.trim(),
            format!("{:x}  a/b", md5::compute(b"payload"))
        );
    }
}
