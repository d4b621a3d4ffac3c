//! validate command implementation

use super::bootstrap;
use crate::StoreOpts;
use anyhow::Result;
use snapferry_core::Validator;

/// Execute the validate command
pub async fn execute(opts: StoreOpts, all: bool, snapshot_ids: Vec<String>) -> Result<()> {
    if !all && snapshot_ids.is_empty() {
        anyhow::bail!("nothing to validate: pass snapshot ids or --all");
    }

    let runtime = bootstrap(opts).await?;
    let validator = Validator::new(
        runtime.options,
        runtime.snapshots,
        runtime.coordinator,
        runtime.volumes,
        runtime.store,
    );

    let report = validator.run(&snapshot_ids, all).await?;
    for id in &report.succeeded {
        println!("validated: {id}");
    }
    for id in &report.skipped {
        println!("skipped (claimed by another worker): {id}");
    }
    if !report.is_clean() {
        for failure in &report.failed {
            eprintln!("{failure}");
        }
        anyhow::bail!(
            "{} of {} validation(s) failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        );
    }
    Ok(())
}
