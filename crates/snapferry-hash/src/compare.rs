//! Sorted hash-list comparison
//!
//! Both sides of a tar validation produce `<md5>  <path>` listings.
//! After byte-order sorting on the path field the listings are merged
//! line by line, so the comparison is independent of filesystem walk
//! and tar entry ordering.

use crate::{HashError, Result};
use snapferry_proc::run_tool_with_env;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// One disagreement between the local and remote listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashDiff {
    /// Present remotely, absent locally
    MissingLocal { path: String },
    /// Present locally, absent remotely
    MissingRemote { path: String },
    /// Present on both sides with different content
    HashDiffers {
        path: String,
        local: String,
        remote: String,
    },
}

impl std::fmt::Display for HashDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingLocal { path } => write!(f, "{path}: missing on local"),
            Self::MissingRemote { path } => write!(f, "{path}: missing on remote"),
            Self::HashDiffers {
                path,
                local,
                remote,
            } => write!(f, "{path}: hash differs (local {local}, remote {remote})"),
        }
    }
}

/// Outcome of comparing two sorted hash listings
#[derive(Debug, Default)]
pub struct Comparison {
    /// Lines that agreed on both hash and path
    pub matched: u64,
    /// Every disagreement found
    pub diffs: Vec<HashDiff>,
}

impl Comparison {
    /// True when every line matched
    pub fn is_clean(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Sort a hash listing in place, byte order on the path field.
///
/// `sort -k 2` keys on everything from the path to end of line, so
/// paths containing spaces stay intact; `LC_ALL=C` pins byte order to
/// match the comparator's merge.
pub async fn sort_hash_list(path: &Path) -> Result<()> {
    let path = path.display().to_string();
    run_tool_with_env(
        "sort",
        ["-k", "2", "-o", path.as_str(), path.as_str()],
        &[("LC_ALL", "C")],
    )
    .await?;
    Ok(())
}

struct HashLines {
    file: String,
    lines: Lines<BufReader<File>>,
}

impl HashLines {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: path.display().to_string(),
            lines: BufReader::new(File::open(path)?).lines(),
        })
    }

    /// Next `(hash, path)` pair, or `None` at end of file
    fn next_entry(&mut self) -> Result<Option<(String, String)>> {
        match self.lines.next() {
            None => Ok(None),
            Some(line) => {
                let line = line?;
                match line.split_once("  ") {
                    Some((hash, path)) if !hash.is_empty() && !path.is_empty() => {
                        Ok(Some((hash.to_string(), path.to_string())))
                    }
                    _ => Err(HashError::BadLine {
                        file: self.file.clone(),
                        line,
                    }),
                }
            }
        }
    }
}

/// Merge-compare two sorted hash listings.
///
/// Returns every mismatch and the count of matched lines; callers
/// cross-check the matched count against the line counts both producers
/// reported, which catches a defective comparator rather than trusting
/// it blindly.
pub fn compare_hash_lists(local: &Path, remote: &Path) -> Result<Comparison> {
    let mut local_lines = HashLines::open(local)?;
    let mut remote_lines = HashLines::open(remote)?;
    let mut comparison = Comparison::default();

    let mut left = local_lines.next_entry()?;
    let mut right = remote_lines.next_entry()?;
    loop {
        match (left.take(), right.take()) {
            (None, None) => break,
            (Some((_, path)), None) => {
                comparison.diffs.push(HashDiff::MissingRemote { path });
                left = local_lines.next_entry()?;
                right = None;
            }
            (None, Some((_, path))) => {
                comparison.diffs.push(HashDiff::MissingLocal { path });
                right = remote_lines.next_entry()?;
                left = None;
            }
            (Some((lhash, lpath)), Some((rhash, rpath))) => {
                match lpath.as_bytes().cmp(rpath.as_bytes()) {
                    Ordering::Equal => {
                        if lhash == rhash {
                            comparison.matched += 1;
                        } else {
                            comparison.diffs.push(HashDiff::HashDiffers {
                                path: lpath,
                                local: lhash,
                                remote: rhash,
                            });
                        }
                        left = local_lines.next_entry()?;
                        right = remote_lines.next_entry()?;
                    }
                    Ordering::Less => {
                        comparison.diffs.push(HashDiff::MissingRemote { path: lpath });
                        left = local_lines.next_entry()?;
                        right = Some((rhash, rpath));
                    }
                    Ordering::Greater => {
                        comparison.diffs.push(HashDiff::MissingLocal { path: rpath });
                        right = remote_lines.next_entry()?;
                        left = Some((lhash, lpath));
                    }
                }
            }
        }
    }
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_list(dir: &TempDir, name: &str, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    const H1: &str = "0cc175b9c0f1b6a831c399e269772661";
    const H2: &str = "92eb5ffee6ae2fec3ad71c777531578f";

    #[test]
    fn test_compare_equal_lists() {
        let temp = TempDir::new().unwrap();
        let lines = [&format!("{H1}  a/b")[..], &format!("{H2}  c")[..]];
        let local = write_list(&temp, "local.md5", &lines);
        let remote = write_list(&temp, "remote.md5", &lines);
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert!(cmp.is_clean());
        assert_eq!(cmp.matched, 2);
    }

    #[test]
    fn test_compare_missing_on_remote() {
        let temp = TempDir::new().unwrap();
        let local = write_list(
            &temp,
            "local.md5",
            &[&format!("{H1}  a")[..], &format!("{H2}  b")[..]],
        );
        let remote = write_list(&temp, "remote.md5", &[&format!("{H1}  a")[..]]);
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert_eq!(cmp.matched, 1);
        assert_eq!(
            cmp.diffs,
            vec![HashDiff::MissingRemote {
                path: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_compare_missing_on_local() {
        let temp = TempDir::new().unwrap();
        let local = write_list(&temp, "local.md5", &[&format!("{H2}  b")[..]]);
        let remote = write_list(
            &temp,
            "remote.md5",
            &[&format!("{H1}  a")[..], &format!("{H2}  b")[..]],
        );
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert_eq!(cmp.matched, 1);
        assert_eq!(
            cmp.diffs,
            vec![HashDiff::MissingLocal {
                path: "a".to_string()
            }]
        );
    }

    #[test]
    fn test_compare_hash_differs() {
        let temp = TempDir::new().unwrap();
        let local = write_list(&temp, "local.md5", &[&format!("{H1}  same/path")[..]]);
        let remote = write_list(&temp, "remote.md5", &[&format!("{H2}  same/path")[..]]);
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert_eq!(cmp.matched, 0);
        assert_eq!(cmp.diffs.len(), 1);
        assert!(matches!(cmp.diffs[0], HashDiff::HashDiffers { .. }));
    }

    #[test]
    fn test_compare_sort_order_traps() {
        // '.' (0x2e) sorts before '/' (0x2f) in byte order: a.b < a/b.
        // Both lists sorted that way must align without spurious diffs.
        let temp = TempDir::new().unwrap();
        let lines = [&format!("{H1}  a.b")[..], &format!("{H2}  a/b")[..]];
        let local = write_list(&temp, "local.md5", &lines);
        let remote = write_list(&temp, "remote.md5", &lines);
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert!(cmp.is_clean());
        assert_eq!(cmp.matched, 2);
    }

    #[test]
    fn test_compare_rejects_malformed_lines() {
        let temp = TempDir::new().unwrap();
        let local = write_list(&temp, "local.md5", &["not-a-hash-line"]);
        let remote = write_list(&temp, "remote.md5", &[]);
        let err = compare_hash_lists(&local, &remote).unwrap_err();
        assert!(matches!(err, HashError::BadLine { .. }));
    }

    #[test]
    fn test_compare_empty_lists() {
        let temp = TempDir::new().unwrap();
        let local = write_list(&temp, "local.md5", &[]);
        let remote = write_list(&temp, "remote.md5", &[]);
        let cmp = compare_hash_lists(&local, &remote).unwrap();
        assert!(cmp.is_clean());
        assert_eq!(cmp.matched, 0);
    }

    #[tokio::test]
    async fn test_sort_hash_list_orders_by_path() {
        let temp = TempDir::new().unwrap();
        let list = write_list(
            &temp,
            "unsorted.md5",
            &[
                &format!("{H2}  zebra")[..],
                &format!("{H1}  apple")[..],
                &format!("{H1}  a/b")[..],
                &format!("{H2}  a.b")[..],
            ],
        );
        sort_hash_list(&list).await.unwrap();
        let sorted = std::fs::read_to_string(&list).unwrap();
        let paths: Vec<&str> = sorted
            .lines()
            .map(|l| l.split_once("  ").unwrap().1)
            .collect();
        assert_eq!(paths, vec!["a.b", "a/b", "apple", "zebra"]);
    }
}
