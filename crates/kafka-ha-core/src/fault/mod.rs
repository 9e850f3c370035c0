//! Fault injection against the cluster's control plane.
//!
//! Every perturbation returns a [`PerturbationHandle`] that knows how to undo
//! it. Failures to apply a perturbation are surfaced to the caller and never
//! retried here, since a late retry would shift the scenario's timeline.

use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::model::{BackoffPolicy, Perturbation, ReplicaId, SignalKind, UnitRef};
use crate::{Error, Result};

mod control_plane;
mod directory;
mod hosts;
mod kubectl;

pub use control_plane::ControlPlane;
pub use directory::UnitDirectory;
pub use hosts::{HostsFile, NameResolver};
pub use kubectl::KubectlControlPlane;

/// How to undo an applied perturbation.
#[derive(Debug, Clone)]
enum Revert {
    Signal { unit: UnitRef, signal: SignalKind },
    RestoreNetwork(UnitRef),
    RestoreBackoff(UnitRef),
    RefreshNames,
}

/// Applies perturbations through a [`ControlPlane`].
#[derive(Clone)]
pub struct FaultInjector {
    control_plane: Arc<dyn ControlPlane>,
    directory: Arc<UnitDirectory>,
    resolver: Option<Arc<dyn NameResolver>>,
    cluster: Arc<KafkaConfig>,
}

impl FaultInjector {
    pub fn new(control_plane: Arc<dyn ControlPlane>, cluster: &KafkaConfig) -> Self {
        Self {
            control_plane,
            directory: Arc::new(UnitDirectory::new(
                cluster.app_name.clone(),
                cluster.broker_id_offset,
            )),
            resolver: None,
            cluster: Arc::new(cluster.clone()),
        }
    }

    /// Keep a name resolver in sync when units are replaced.
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn directory(&self) -> &UnitDirectory {
        &self.directory
    }

    /// Unit hosting a replica.
    pub async fn unit_for(&self, replica: ReplicaId) -> Result<UnitRef> {
        self.directory
            .resolve(self.control_plane.as_ref(), replica)
            .await
    }

    pub async fn units(&self) -> Result<Vec<UnitRef>> {
        self.control_plane.list_units().await
    }

    /// Deliver a signal to one unit's broker process.
    pub async fn send_signal(
        &self,
        unit: &UnitRef,
        signal: SignalKind,
    ) -> Result<PerturbationHandle> {
        self.control_plane
            .send_signal(unit, signal)
            .await
            .map_err(|e| delivery_error(unit, e))?;
        info!("Applied {} to {}", signal, unit);

        let revert = match signal {
            SignalKind::Stop => Some(Revert::Signal {
                unit: unit.clone(),
                signal: SignalKind::Continue,
            }),
            // The supervisor brings terminated or killed processes back
            SignalKind::Terminate | SignalKind::Kill | SignalKind::Continue => None,
        };
        Ok(self.handle(
            Perturbation::Signal {
                target: unit.clone(),
                kind: signal,
            },
            revert,
        ))
    }

    /// Signal every unit concurrently, failing the whole step if any target fails.
    pub async fn send_signal_all(
        &self,
        units: &[UnitRef],
        signal: SignalKind,
        join_timeout: Duration,
    ) -> Result<Vec<PerturbationHandle>> {
        info!("Dispatching {} to {} units", signal, units.len());
        let dispatch = join_all(units.iter().map(|unit| self.send_signal(unit, signal)));
        let results = tokio::time::timeout(join_timeout, dispatch)
            .await
            .map_err(|_| Error::TimeoutExceeded {
                operation: format!("{} to {} units", signal, units.len()),
                timeout: join_timeout,
            })?;

        let mut handles = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => warn!("Additional dispatch failure: {}", e),
            }
        }

        match failure {
            Some(e) => {
                release_all(&mut handles).await;
                Err(e)
            }
            None => Ok(handles),
        }
    }

    /// Cut one unit off from the rest of the cluster.
    pub async fn isolate(&self, unit: &UnitRef) -> Result<PerturbationHandle> {
        self.control_plane
            .isolate(unit)
            .await
            .map_err(|e| delivery_error(unit, e))?;
        info!("Isolated {}", unit);
        Ok(self.handle(
            Perturbation::NetworkIsolate {
                target: unit.clone(),
            },
            Some(Revert::RestoreNetwork(unit.clone())),
        ))
    }

    /// Remove any isolation of `unit`; a no-op when none is active.
    pub async fn restore_network(&self, unit: &UnitRef) -> Result<()> {
        self.control_plane
            .restore_network(unit)
            .await
            .map_err(|e| delivery_error(unit, e))?;
        info!("Restored network of {}", unit);
        Ok(())
    }

    /// Replace the unit's execution host. Cached unit addresses are dropped.
    pub async fn delete_unit(&self, unit: &UnitRef) -> Result<PerturbationHandle> {
        self.control_plane
            .delete_unit(unit)
            .await
            .map_err(|e| delivery_error(unit, e))?;
        self.directory.invalidate();
        info!("Deleted {}; unit addresses must be re-resolved", unit);
        Ok(self.handle(
            Perturbation::UnitDelete {
                target: unit.clone(),
            },
            Some(Revert::RefreshNames),
        ))
    }

    /// Set the supervisor restart backoff on every unit.
    pub async fn set_restart_backoff(
        &self,
        policy: BackoffPolicy,
    ) -> Result<Vec<PerturbationHandle>> {
        let units = self.units().await?;
        let mut handles = Vec::with_capacity(units.len());
        for unit in &units {
            if let Err(e) = self.control_plane.set_restart_backoff(unit, policy).await {
                release_all(&mut handles).await;
                return Err(delivery_error(unit, e));
            }
            let revert = match policy {
                BackoffPolicy::Extend => Some(Revert::RestoreBackoff(unit.clone())),
                BackoffPolicy::Restore => None,
            };
            handles.push(self.handle(
                Perturbation::RestartDelayPolicy {
                    target: unit.clone(),
                    policy,
                },
                revert,
            ));
        }
        info!("Restart backoff {:?} on {} units", policy, units.len());
        Ok(handles)
    }

    /// Re-derive unit addresses and rewrite name resolution.
    pub async fn refresh_name_resolution(&self) -> Result<()> {
        self.directory.invalidate();
        let addresses = self.directory.addresses(self.control_plane.as_ref()).await?;
        if let Some(resolver) = &self.resolver {
            let entries: Vec<(String, String)> = addresses
                .iter()
                .map(|(unit, address)| (self.cluster.member_host(unit.index), address.clone()))
                .collect();
            resolver.refresh(&entries).await?;
        }
        Ok(())
    }

    /// Remove every name-resolution entry this harness manages.
    pub async fn clear_name_resolution(&self) -> Result<()> {
        self.directory.invalidate();
        match &self.resolver {
            Some(resolver) => resolver.clear().await,
            None => Ok(()),
        }
    }

    fn handle(&self, perturbation: Perturbation, revert: Option<Revert>) -> PerturbationHandle {
        PerturbationHandle {
            perturbation,
            revert,
            injector: self.clone(),
        }
    }

    async fn revert(&self, revert: &Revert) -> Result<()> {
        match revert {
            Revert::Signal { unit, signal } => self
                .control_plane
                .send_signal(unit, *signal)
                .await
                .map_err(|e| delivery_error(unit, e)),
            Revert::RestoreNetwork(unit) => self.restore_network(unit).await,
            Revert::RestoreBackoff(unit) => self
                .control_plane
                .set_restart_backoff(unit, BackoffPolicy::Restore)
                .await
                .map_err(|e| delivery_error(unit, e)),
            Revert::RefreshNames => self.refresh_name_resolution().await,
        }
    }
}

/// Control-plane failures surface as delivery failures naming the target.
fn delivery_error(unit: &UnitRef, error: Error) -> Error {
    match error {
        e @ (Error::DeliveryFailed { .. } | Error::NotFound(_) | Error::TimeoutExceeded { .. }) => e,
        other => Error::DeliveryFailed {
            target: unit.to_string(),
            message: other.to_string(),
        },
    }
}

/// Release every handle, logging failures.
pub async fn release_all(handles: &mut [PerturbationHandle]) {
    for handle in handles.iter_mut() {
        if let Err(e) = handle.release().await {
            warn!("Failed to revert '{}': {}", handle.perturbation(), e);
        }
    }
}

/// An applied perturbation and the means to undo it.
///
/// Dropping a handle that still needs release logs a warning and spawns the
/// revert on the current runtime.
pub struct PerturbationHandle {
    perturbation: Perturbation,
    revert: Option<Revert>,
    injector: FaultInjector,
}

impl PerturbationHandle {
    pub fn perturbation(&self) -> &Perturbation {
        &self.perturbation
    }

    pub fn needs_release(&self) -> bool {
        self.revert.is_some()
    }

    /// Undo the perturbation. Calling it again after success does nothing.
    pub async fn release(&mut self) -> Result<()> {
        let Some(revert) = self.revert.take() else {
            return Ok(());
        };
        match self.injector.revert(&revert).await {
            Ok(()) => {
                info!("Reverted '{}'", self.perturbation);
                Ok(())
            }
            Err(e) => {
                self.revert = Some(revert);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for PerturbationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerturbationHandle")
            .field("perturbation", &self.perturbation)
            .field("revert", &self.revert)
            .finish()
    }
}

impl Drop for PerturbationHandle {
    fn drop(&mut self) {
        let Some(revert) = self.revert.take() else {
            return;
        };
        warn!(
            "Perturbation '{}' dropped without release; reverting in background",
            self.perturbation
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let injector = self.injector.clone();
                let label = self.perturbation.to_string();
                runtime.spawn(async move {
                    if let Err(e) = injector.revert(&revert).await {
                        warn!("Background revert of '{}' failed: {}", label, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to revert '{}'; run `kafka-ha cleanup`",
                self.perturbation
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Records every call; fails for units listed in `broken`.
    #[derive(Default)]
    struct RecordingControlPlane {
        calls: Mutex<Vec<String>>,
        broken: HashSet<u32>,
    }

    impl RecordingControlPlane {
        fn record(&self, unit: &UnitRef, what: &str) -> Result<()> {
            if self.broken.contains(&unit.index) {
                return Err(Error::ControlPlane(format!("{} unreachable", unit)));
            }
            self.calls.lock().push(format!("{} {}", what, unit));
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ControlPlane for RecordingControlPlane {
        async fn send_signal(&self, unit: &UnitRef, signal: SignalKind) -> Result<()> {
            self.record(unit, signal.as_str())
        }
        async fn isolate(&self, unit: &UnitRef) -> Result<()> {
            self.record(unit, "isolate")
        }
        async fn restore_network(&self, unit: &UnitRef) -> Result<()> {
            self.record(unit, "restore")
        }
        async fn delete_unit(&self, unit: &UnitRef) -> Result<()> {
            self.record(unit, "delete")
        }
        async fn set_restart_backoff(&self, unit: &UnitRef, policy: BackoffPolicy) -> Result<()> {
            self.record(unit, &format!("backoff-{:?}", policy))
        }
        async fn unit_address(&self, unit: &UnitRef) -> Result<String> {
            Ok(format!("10.0.0.{}", unit.index))
        }
        async fn list_units(&self) -> Result<Vec<UnitRef>> {
            Ok((0..3).map(|i| UnitRef::new("kafka-k8s", i)).collect())
        }
    }

    fn injector(control_plane: Arc<RecordingControlPlane>) -> FaultInjector {
        FaultInjector::new(
            control_plane,
            &KafkaConfig::with_bootstrap(vec!["localhost:9092".to_string()]),
        )
    }

    fn unit(index: u32) -> UnitRef {
        UnitRef::new("kafka-k8s", index)
    }

    #[tokio::test]
    async fn test_stop_reverts_with_continue() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let injector = injector(control_plane.clone());

        let mut handle = injector.send_signal(&unit(0), SignalKind::Stop).await.unwrap();
        assert!(handle.needs_release());
        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert_eq!(
            control_plane.calls(),
            vec!["SIGSTOP kafka-k8s/0", "SIGCONT kafka-k8s/0"]
        );
    }

    #[tokio::test]
    async fn test_kill_needs_no_release() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let handle = injector(control_plane)
            .send_signal(&unit(1), SignalKind::Kill)
            .await
            .unwrap();
        assert!(!handle.needs_release());
    }

    #[tokio::test]
    async fn test_failure_is_delivery_failed() {
        let control_plane = Arc::new(RecordingControlPlane {
            broken: HashSet::from([2]),
            ..Default::default()
        });
        let err = injector(control_plane)
            .isolate(&unit(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { ref target, .. } if target == "kafka-k8s/2"));
    }

    #[tokio::test]
    async fn test_fan_out_fails_whole_step_and_reverts_the_rest() {
        let control_plane = Arc::new(RecordingControlPlane {
            broken: HashSet::from([1]),
            ..Default::default()
        });
        let injector = injector(control_plane.clone());
        let units: Vec<UnitRef> = (0..3).map(unit).collect();

        let err = injector
            .send_signal_all(&units, SignalKind::Stop, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));

        let calls = control_plane.calls();
        assert!(calls.contains(&"SIGCONT kafka-k8s/0".to_string()));
        assert!(calls.contains(&"SIGCONT kafka-k8s/2".to_string()));
    }

    #[tokio::test]
    async fn test_extend_backoff_reverts_every_unit() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let injector = injector(control_plane.clone());

        let mut handles = injector
            .set_restart_backoff(BackoffPolicy::Extend)
            .await
            .unwrap();
        assert_eq!(handles.len(), 3);
        release_all(&mut handles).await;

        let restores = control_plane
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("backoff-Restore"))
            .count();
        assert_eq!(restores, 3);
    }

    #[tokio::test]
    async fn test_delete_invalidates_directory() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let injector = injector(control_plane.clone());

        injector.refresh_name_resolution().await.unwrap();
        assert!(injector.directory().is_cached());

        let mut handle = injector.delete_unit(&unit(0)).await.unwrap();
        assert!(!injector.directory().is_cached());

        handle.release().await.unwrap();
        assert!(injector.directory().is_cached());
    }

    #[tokio::test]
    async fn test_dropped_handle_reverts_in_background() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let injector = injector(control_plane.clone());

        drop(injector.isolate(&unit(1)).await.unwrap());
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert!(control_plane
            .calls()
            .contains(&"restore kafka-k8s/1".to_string()));
    }
}
