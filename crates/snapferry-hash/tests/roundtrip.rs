//! Round-trip: a directory tree archived to tar and hashed through the
//! stream parser must agree file-for-file with a direct walk of the
//! same tree, independent of walk and archive ordering.

use snapferry_hash::{compare_hash_lists, dir_entry_hashes, sort_hash_list, tar_entry_hashes};
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;

fn populate(tree: &Path) -> usize {
    // Varied sizes and sort-order traps: a.b vs a/b, deep nesting,
    // names with spaces.
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("a.b", b"dot file".to_vec()),
        ("a/b", b"slash file".to_vec()),
        ("a/deeper/nested/file.bin", vec![0xAB; 1024 * 1024]),
        ("empty", Vec::new()),
        ("name with space.txt", b"spaces".to_vec()),
        ("zz-last", vec![7u8; 4096]),
    ];
    for (path, data) in &files {
        let full = tree.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, data).unwrap();
    }
    files.len()
}

/// Archive the tree the way the upload pipeline does: entries relative
/// to the tree root with `./` prefixes, in directory-walk order.
fn tar_of(tree: &Path) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", tree).unwrap();
    builder.into_inner().unwrap()
}

#[tokio::test]
async fn test_tar_roundtrip_matches_directory_walk() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    std::fs::create_dir(&tree).unwrap();
    let expected = populate(&tree) as u64;

    let archive = tar_of(&tree);

    let remote_list = temp.path().join("remote.md5");
    let local_list = temp.path().join("local.md5");

    let remote_count = tar_entry_hashes(Cursor::new(archive), &remote_list)
        .await
        .unwrap();
    let local_count = dir_entry_hashes(&tree, &local_list, |_| {}).await.unwrap();
    assert_eq!(remote_count, expected);
    assert_eq!(local_count, expected);

    sort_hash_list(&remote_list).await.unwrap();
    sort_hash_list(&local_list).await.unwrap();

    let comparison = compare_hash_lists(&local_list, &remote_list).unwrap();
    assert!(
        comparison.is_clean(),
        "unexpected diffs: {:?}",
        comparison.diffs
    );
    assert_eq!(comparison.matched, expected);
}

#[tokio::test]
async fn test_tar_roundtrip_detects_corruption() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    std::fs::create_dir(&tree).unwrap();
    populate(&tree);

    let archive = tar_of(&tree);

    let remote_list = temp.path().join("remote.md5");
    let local_list = temp.path().join("local.md5");
    tar_entry_hashes(Cursor::new(archive), &remote_list)
        .await
        .unwrap();

    // Flip a file after archiving: the walk side must disagree.
    std::fs::write(tree.join("a/b"), b"tampered").unwrap();
    dir_entry_hashes(&tree, &local_list, |_| {}).await.unwrap();

    sort_hash_list(&remote_list).await.unwrap();
    sort_hash_list(&local_list).await.unwrap();

    let comparison = compare_hash_lists(&local_list, &remote_list).unwrap();
    assert_eq!(comparison.diffs.len(), 1);
    assert!(matches!(
        comparison.diffs[0],
        snapferry_hash::HashDiff::HashDiffers { ref path, .. } if path == "a/b"
    ));
}

#[tokio::test]
async fn test_tar_missing_file_reported_as_missing_on_remote() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    std::fs::create_dir(&tree).unwrap();
    populate(&tree);

    let archive = tar_of(&tree);

    let remote_list = temp.path().join("remote.md5");
    let local_list = temp.path().join("local.md5");
    tar_entry_hashes(Cursor::new(archive), &remote_list)
        .await
        .unwrap();

    // A file created after the archive exists only locally.
    std::fs::write(tree.join("straggler"), b"new").unwrap();
    dir_entry_hashes(&tree, &local_list, |_| {}).await.unwrap();

    sort_hash_list(&remote_list).await.unwrap();
    sort_hash_list(&local_list).await.unwrap();

    let comparison = compare_hash_lists(&local_list, &remote_list).unwrap();
    assert_eq!(comparison.diffs.len(), 1);
    assert!(matches!(
        comparison.diffs[0],
        snapferry_hash::HashDiff::MissingRemote { ref path } if path == "straggler"
    ));
}
