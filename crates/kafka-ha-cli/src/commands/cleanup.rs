use anyhow::{bail, Result};
use kafka_ha_core::{BackoffPolicy, FaultInjector, HostsFile, KubectlControlPlane};
use std::sync::Arc;
use tracing::{info, warn};

/// Restore network, restart backoff and name resolution on every unit.
///
/// Every step is idempotent, so this is safe to run after a clean exit too.
pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let control_plane_config = config.require_control_plane()?;

    let control_plane = Arc::new(KubectlControlPlane::new(
        control_plane_config.clone(),
        config.cluster.app_name.clone(),
        config.cluster.replica_count,
    ));
    let injector = FaultInjector::new(control_plane, &config.cluster)
        .with_resolver(Arc::new(HostsFile::new(control_plane_config.hosts_file.clone())));

    let mut failures = 0;
    for unit in injector.units().await? {
        if let Err(e) = injector.restore_network(&unit).await {
            warn!("Network restore on {} failed: {}", unit, e);
            failures += 1;
        }
    }

    if let Err(e) = injector.set_restart_backoff(BackoffPolicy::Restore).await {
        warn!("Restart backoff restore failed: {}", e);
        failures += 1;
    }

    if let Err(e) = injector.clear_name_resolution().await {
        warn!("Removing managed hosts entries failed: {}", e);
        failures += 1;
    }

    if failures > 0 {
        bail!("{} cleanup steps failed", failures);
    }
    info!("Cleanup complete");
    Ok(())
}
