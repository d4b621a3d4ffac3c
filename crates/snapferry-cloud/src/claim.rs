//! Tag-based claim protocol
//!
//! The tagging API has no compare-and-swap, so mutual exclusion is
//! built from a nonce and a settle sleep: write both tags, wait out the
//! eventual-consistency window, read back, and only the worker whose
//! nonce survived proceeds. The settle interval must exceed the tag
//! consistency window; do not shorten it.

use crate::snapshot::Snapshot;
use crate::{CloudError, Result};
use aws_sdk_ec2::types::Tag;
use aws_sdk_ec2::Client;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How long concurrent writers get to become visible (4 s)
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(4);

/// Snapshot lifecycle states carried in the claim tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapState {
    /// Queued for migration
    Migrate,
    /// A worker is uploading
    Migrating,
    /// Upload complete
    Migrated,
    /// A worker is validating
    Validating,
    /// Validation passed
    Validated,
}

impl SnapState {
    /// Tag value for this state
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::Migrating => "migrating",
            Self::Migrated => "migrated",
            Self::Validating => "validating",
            Self::Validated => "validated",
        }
    }
}

impl fmt::Display for SnapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "migrate" => Ok(Self::Migrate),
            "migrating" => Ok(Self::Migrating),
            "migrated" => Ok(Self::Migrated),
            "validating" => Ok(Self::Validating),
            "validated" => Ok(Self::Validated),
            other => Err(format!("unknown snapshot state: {other}")),
        }
    }
}

/// A claim this worker holds on one snapshot
#[derive(Debug, Clone)]
pub struct Claim {
    /// Claimed snapshot
    pub snapshot_id: String,
    /// The nonce that won the race
    pub nonce: u32,
    /// Claim-tag value before this worker wrote, for failure recovery
    pub prior: Option<String>,
}

/// What the read-back after the settle interval showed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Our state and our nonce survived
    Won,
    /// Our state survived under another worker's nonce
    AlreadyMarked { other_nonce: String },
    /// A different state replaced ours entirely
    Lost { actual: Option<String> },
}

impl ClaimOutcome {
    /// Evaluate the read-back tag set against what this worker wrote
    pub fn decide(tags: &[(String, String)], tag_key: &str, state: SnapState, nonce: u32) -> Self {
        let nonce_key = format!("{tag_key}-id");
        let tag = tags.iter().find(|(k, _)| k == tag_key).map(|(_, v)| v);
        let seen_nonce = tags.iter().find(|(k, _)| k == &nonce_key).map(|(_, v)| v);

        match tag {
            Some(value) if value == state.as_str() => match seen_nonce {
                Some(n) if n == &nonce.to_string() => Self::Won,
                Some(n) => Self::AlreadyMarked {
                    other_nonce: n.clone(),
                },
                None => Self::Lost { actual: None },
            },
            other => Self::Lost {
                actual: other.cloned(),
            },
        }
    }
}

/// The state a failed validation hands the snapshot back in.
///
/// `validated`/`validating` collapse to `migrated` (this run just
/// proved the old verdict wrong); an absent prior tag collapses to the
/// empty string.
pub fn recovery_state(prior: Option<&str>) -> &str {
    match prior {
        Some("validated") | Some("validating") => "migrated",
        Some(other) => other,
        None => "",
    }
}

/// Claim-tag coordinator for one tag key
#[derive(Debug, Clone)]
pub struct Coordinator {
    ec2: Client,
    tag_key: String,
}

impl Coordinator {
    /// Coordinate via the given user tag key
    pub fn new(ec2: Client, tag_key: impl Into<String>) -> Self {
        Self {
            ec2,
            tag_key: tag_key.into(),
        }
    }

    /// The claim tag key
    pub fn tag_key(&self) -> &str {
        &self.tag_key
    }

    /// The nonce tag key
    pub fn nonce_key(&self) -> String {
        format!("{}-id", self.tag_key)
    }

    /// Attempt to move `snapshot` into `state` under mutual exclusion.
    ///
    /// Returns the claim on success; [`CloudError::ClaimLost`] when a
    /// concurrent worker won instead.
    pub async fn claim(&self, snapshot: &Snapshot, state: SnapState) -> Result<Claim> {
        let nonce: u32 = rand::random();
        let prior = snapshot.tag_value(&self.tag_key).map(String::from);

        self.write_tags(&snapshot.id, &[
            (self.tag_key.clone(), state.as_str().to_string()),
            (self.nonce_key(), nonce.to_string()),
        ])
        .await?;

        tracing::debug!(
            snapshot = %snapshot.id,
            state = %state,
            nonce,
            "claim written, settling"
        );
        tokio::time::sleep(SETTLE_INTERVAL).await;

        let tags = self.read_tags(&snapshot.id).await?;
        match ClaimOutcome::decide(&tags, &self.tag_key, state, nonce) {
            ClaimOutcome::Won => Ok(Claim {
                snapshot_id: snapshot.id.clone(),
                nonce,
                prior,
            }),
            ClaimOutcome::AlreadyMarked { other_nonce } => Err(CloudError::ClaimLost {
                snapshot_id: snapshot.id.clone(),
                reason: format!("already marked {state} by nonce {other_nonce}"),
            }),
            ClaimOutcome::Lost { actual } => Err(CloudError::ClaimLost {
                snapshot_id: snapshot.id.clone(),
                reason: match actual {
                    Some(value) => format!("state became {value:?} during settle"),
                    None => "claim tag disappeared during settle".to_string(),
                },
            }),
        }
    }

    /// Settle a finished claim: drop the nonce, write the terminal state
    pub async fn complete(&self, snapshot_id: &str, terminal: &str) -> Result<()> {
        self.delete_tag(snapshot_id, &self.nonce_key()).await?;
        self.write_tags(
            snapshot_id,
            &[(self.tag_key.clone(), terminal.to_string())],
        )
        .await
    }

    /// Hand a failed migration back to the queue
    pub async fn recover_migration(&self, snapshot_id: &str) -> Result<()> {
        self.complete(snapshot_id, SnapState::Migrate.as_str()).await
    }

    /// Restore the pre-claim state after a failed validation
    pub async fn recover_validation(&self, claim: &Claim) -> Result<()> {
        self.complete(&claim.snapshot_id, recovery_state(claim.prior.as_deref()))
            .await
    }

    async fn write_tags(&self, snapshot_id: &str, tags: &[(String, String)]) -> Result<()> {
        let mut req = self.ec2.create_tags().resources(snapshot_id);
        for (key, value) in tags {
            req = req.tags(Tag::builder().key(key).value(value).build());
        }
        req.send().await.map_err(|e| CloudError::Api {
            op: "create_tags",
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn delete_tag(&self, snapshot_id: &str, key: &str) -> Result<()> {
        self.ec2
            .delete_tags()
            .resources(snapshot_id)
            .tags(Tag::builder().key(key).build())
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "delete_tags",
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_tags(&self, snapshot_id: &str) -> Result<Vec<(String, String)>> {
        let out = self
            .ec2
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "describe_snapshots",
                message: e.to_string(),
            })?;
        Ok(out
            .snapshots()
            .first()
            .map(|s| {
                s.tags()
                    .iter()
                    .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            SnapState::Migrate,
            SnapState::Migrating,
            SnapState::Migrated,
            SnapState::Validating,
            SnapState::Validated,
        ] {
            assert_eq!(state.as_str().parse::<SnapState>().unwrap(), state);
        }
        assert!("garbage".parse::<SnapState>().is_err());
    }

    #[test]
    fn test_claim_won_when_state_and_nonce_survive() {
        let read_back = tags(&[("backup", "migrating"), ("backup-id", "42")]);
        assert_eq!(
            ClaimOutcome::decide(&read_back, "backup", SnapState::Migrating, 42),
            ClaimOutcome::Won
        );
    }

    #[test]
    fn test_claim_already_marked_when_nonce_lost() {
        // Two workers wrote the same state; the other nonce stuck.
        let read_back = tags(&[("backup", "migrating"), ("backup-id", "7")]);
        assert_eq!(
            ClaimOutcome::decide(&read_back, "backup", SnapState::Migrating, 42),
            ClaimOutcome::AlreadyMarked {
                other_nonce: "7".to_string()
            }
        );
    }

    #[test]
    fn test_claim_lost_when_state_replaced() {
        let read_back = tags(&[("backup", "validated"), ("backup-id", "42")]);
        assert_eq!(
            ClaimOutcome::decide(&read_back, "backup", SnapState::Migrating, 42),
            ClaimOutcome::Lost {
                actual: Some("validated".to_string())
            }
        );
    }

    #[test]
    fn test_claim_lost_when_tags_vanish() {
        assert_eq!(
            ClaimOutcome::decide(&[], "backup", SnapState::Migrating, 42),
            ClaimOutcome::Lost { actual: None }
        );
    }

    #[test]
    fn test_claim_safety_two_workers() {
        // Whatever single (state, nonce) pair the read-back converges
        // to, at most one of two contending workers decides Won.
        let read_back = tags(&[("backup", "migrating"), ("backup-id", "1111")]);
        let worker_a = ClaimOutcome::decide(&read_back, "backup", SnapState::Migrating, 1111);
        let worker_b = ClaimOutcome::decide(&read_back, "backup", SnapState::Migrating, 2222);
        let wins = [&worker_a, &worker_b]
            .iter()
            .filter(|o| ***o == ClaimOutcome::Won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_recovery_state_collapses_validation_states() {
        assert_eq!(recovery_state(Some("validated")), "migrated");
        assert_eq!(recovery_state(Some("validating")), "migrated");
        assert_eq!(recovery_state(Some("migrated")), "migrated");
        assert_eq!(recovery_state(Some("migrate")), "migrate");
        assert_eq!(recovery_state(None), "");
    }
}
