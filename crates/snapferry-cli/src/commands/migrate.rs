//! migrate command implementation

use super::bootstrap;
use crate::StoreOpts;
use anyhow::Result;
use snapferry_core::Migrator;

/// Execute the migrate command
pub async fn execute(opts: StoreOpts, all: bool, snapshot_ids: Vec<String>) -> Result<()> {
    if !all && snapshot_ids.is_empty() {
        anyhow::bail!("nothing to migrate: pass snapshot ids or --all");
    }

    let runtime = bootstrap(opts).await?;
    let migrator = Migrator::new(
        runtime.options,
        runtime.snapshots,
        runtime.coordinator,
        runtime.volumes,
        runtime.store,
    );

    let migrated = migrator.run(&snapshot_ids, all).await?;
    println!("Migrated {} snapshot(s)", migrated.len());
    for id in &migrated {
        println!("  {id}");
    }
    Ok(())
}
