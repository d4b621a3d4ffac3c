//! Object key derivation and tag sanitization
//!
//! Keys are deterministic functions of the snapshot so re-running a
//! migration finds the object it produced last time. Two shapes exist:
//! a whole-volume raw image and a per-partition tar archive.

use chrono::{DateTime, SecondsFormat, Utc};

/// S3 multipart part-count ceiling
pub const MAX_PARTS: u64 = 10_000;

/// S3 minimum part size (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Slack added to the size estimate before sizing parts (10 MiB).
///
/// The estimate is only a lower bound; the slack plus the 10% part
/// head-room guarantees the stream still fits under [`MAX_PARTS`] when
/// actual bytes overrun it.
pub const SIZE_SLACK: u64 = 10 * 1024 * 1024;

/// Pick the multipart part size for an upload of roughly `estimate`
/// bytes, such that `part_size * MAX_PARTS >= estimate + SIZE_SLACK`
/// with a 10% margin, and never below [`MIN_PART_SIZE`].
pub fn part_size_for(estimate: u64) -> u64 {
    let usable_parts = MAX_PARTS * 9 / 10;
    (estimate + SIZE_SLACK).div_ceil(usable_parts).max(MIN_PART_SIZE)
}

fn base_key(
    volume_id: &str,
    start_time: DateTime<Utc>,
    snapshot_id: &str,
    description: &str,
) -> String {
    let mut key = format!(
        "{volume_id}/{} {snapshot_id}",
        start_time.to_rfc3339_opts(SecondsFormat::Secs, false)
    );
    if !description.is_empty() {
        key.push_str(" - ");
        key.push_str(description);
    }
    key
}

/// Key for a whole-volume raw image (dd mode)
pub fn raw_image_key(
    volume_id: &str,
    start_time: DateTime<Utc>,
    snapshot_id: &str,
    description: &str,
) -> String {
    let mut key = base_key(volume_id, start_time, snapshot_id, description);
    key.push_str(".img.lz4");
    key
}

/// Key for one partition's tar archive (tar mode).
///
/// `partition` is empty when the volume has no partition table and the
/// archive covers the whole filesystem.
pub fn partition_tar_key(
    volume_id: &str,
    start_time: DateTime<Utc>,
    snapshot_id: &str,
    description: &str,
    partition: &str,
) -> String {
    let mut key = base_key(volume_id, start_time, snapshot_id, description);
    if !partition.is_empty() {
        key.push('.');
        key.push_str(partition);
    }
    key.push_str(".tar.lz4");
    key
}

/// Replace every character S3 tagging rejects with `_`.
///
/// The allowed alphabet is letters, digits, whitespace and `+ = . _ : / -`.
pub fn sanitize_tag(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '+' | '=' | '.' | '_' | ':' | '/' | '-')
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The snapshot's user tags, minus the two coordination tags, sanitized
/// for S3.
pub fn object_tags(snapshot_tags: &[(String, String)], claim_tag: &str) -> Vec<(String, String)> {
    let nonce_tag = format!("{claim_tag}-id");
    snapshot_tags
        .iter()
        .filter(|(key, _)| key != claim_tag && key != &nonce_tag)
        .map(|(key, value)| (sanitize_tag(key), sanitize_tag(value)))
        .collect()
}

/// Render tags as the URL-encoded `Tagging` header S3 expects
pub fn tagging_header(tags: &[(String, String)]) -> String {
    tags.iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_raw_image_key_without_description() {
        assert_eq!(
            raw_image_key("vol-A", start_time(), "snap-A", ""),
            "vol-A/2024-01-02T03:04:05+00:00 snap-A.img.lz4"
        );
    }

    #[test]
    fn test_raw_image_key_with_description() {
        assert_eq!(
            raw_image_key("vol-A", start_time(), "snap-A", "weekly"),
            "vol-A/2024-01-02T03:04:05+00:00 snap-A - weekly.img.lz4"
        );
    }

    #[test]
    fn test_partition_tar_keys() {
        // Both shapes from one snapshot: bare filesystem and a named
        // partition.
        assert_eq!(
            partition_tar_key("vol-B", start_time(), "snap-B", "nightly", ""),
            "vol-B/2024-01-02T03:04:05+00:00 snap-B - nightly.tar.lz4"
        );
        assert_eq!(
            partition_tar_key("vol-B", start_time(), "snap-B", "nightly", "xvdf1"),
            "vol-B/2024-01-02T03:04:05+00:00 snap-B - nightly.xvdf1.tar.lz4"
        );
        assert_eq!(
            partition_tar_key("vol-B", start_time(), "snap-B", "", "xvdf2"),
            "vol-B/2024-01-02T03:04:05+00:00 snap-B.xvdf2.tar.lz4"
        );
    }

    #[test]
    fn test_part_size_ceiling_invariant() {
        let estimates = [
            0u64,
            1,
            MIN_PART_SIZE,
            1 << 30,
            100 << 30,
            1 << 40,
            16 << 40,
        ];
        for estimate in estimates {
            let part_size = part_size_for(estimate);
            assert!(part_size >= MIN_PART_SIZE, "estimate {estimate}");
            assert!(
                part_size * MAX_PARTS >= estimate + SIZE_SLACK,
                "estimate {estimate}: part_size {part_size}"
            );
        }
    }

    #[test]
    fn test_part_size_small_streams_use_minimum() {
        assert_eq!(part_size_for(0), MIN_PART_SIZE);
        assert_eq!(part_size_for(1 << 30), MIN_PART_SIZE);
    }

    #[test]
    fn test_sanitize_tag_alphabet() {
        assert_eq!(sanitize_tag("Name=web/prod_1:a.b-c +x"), "Name=web/prod_1:a.b-c +x");
        assert_eq!(sanitize_tag("bad!chars(here)"), "bad_chars_here_");
        let sanitized = sanitize_tag("весь*мир");
        assert!(sanitized.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '+' | '=' | '.' | '_' | ':' | '/' | '-')
        }));
    }

    #[test]
    fn test_object_tags_strip_coordination_tags() {
        let tags = vec![
            ("Name".to_string(), "db backup".to_string()),
            ("snap-to-s3".to_string(), "migrating".to_string()),
            ("snap-to-s3-id".to_string(), "12345".to_string()),
            ("team".to_string(), "infra!ops".to_string()),
        ];
        let filtered = object_tags(&tags, "snap-to-s3");
        assert_eq!(
            filtered,
            vec![
                ("Name".to_string(), "db backup".to_string()),
                ("team".to_string(), "infra_ops".to_string()),
            ]
        );
    }

    #[test]
    fn test_tagging_header_is_url_encoded() {
        let tags = vec![("Name".to_string(), "db backup+x".to_string())];
        assert_eq!(tagging_header(&tags), "Name=db%20backup%2Bx");
        assert_eq!(tagging_header(&[]), "");
    }
}
