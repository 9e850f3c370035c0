//! Chaos engineering tests for kafka-ha-core.
//!
//! These tests drive failure scenarios to verify the harness verdicts:
//! - Broker process failures (kill, terminate, freeze, whole cluster)
//! - Network partitions of the leader
//! - Partition leadership moves after unit replacement

pub mod broker_failures;
pub mod network_partitions;
pub mod partition_leadership;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use kafka_ha_core::{
    BackoffPolicy, ClusterObserver, ControlPlane, Error, FaultInjector, HarnessConfig, PublishAck,
    Record, RecordPublisher, Result, ScenarioOrchestrator, ScenarioReport, SignalKind,
    SimulatedCluster, UnitRef,
};

pub const TOPIC: &str = "ha-test-topic";

/// Three brokers (ids 100..=102), one partition, replication factor 3.
pub fn harness_config() -> HarnessConfig {
    HarnessConfig::from_yaml_str(
        r#"
cluster:
  bootstrap_servers: ["kafka-k8s-0.kafka-k8s-endpoints:9092"]
topic:
  name: ha-test-topic
"#,
    )
    .expect("test config parses")
}

pub fn simulated(config: &HarnessConfig) -> (ScenarioOrchestrator, Arc<SimulatedCluster>) {
    ScenarioOrchestrator::simulated(config)
}

/// Observer and injector wired to a fresh simulated cluster.
pub fn components(config: &HarnessConfig) -> (Arc<SimulatedCluster>, ClusterObserver, FaultInjector) {
    let cluster = Arc::new(
        SimulatedCluster::new(&config.cluster, config.simulation.clone()).with_topic(&config.topic),
    );
    let observer = ClusterObserver::new(cluster.clone(), config.observer.clone());
    let injector = FaultInjector::new(cluster.clone(), &config.cluster);
    (cluster, observer, injector)
}

/// Panic with the whole report when a scenario did not pass.
pub fn assert_passed(report: &ScenarioReport) {
    assert!(
        report.passed,
        "{}\n{}",
        report.summary(),
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
    assert!(report.failed_step.is_none());
    assert!(report.consistency.as_ref().is_some_and(|c| c.passed));
}

/// A simulated cluster that stops acknowledging writes for good once any
/// perturbation reaches it. Delivery takes a second, like `kubectl exec`, so
/// the writer keeps landing records right up to the fault.
pub struct WedgedCluster {
    inner: Arc<SimulatedCluster>,
    wedged: AtomicBool,
}

impl WedgedCluster {
    const DELIVERY_LATENCY: Duration = Duration::from_secs(1);

    async fn wedge(&self) {
        sleep(Self::DELIVERY_LATENCY).await;
        self.wedged.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordPublisher for WedgedCluster {
    async fn publish(&self, topic: &str, record: &Record) -> Result<PublishAck> {
        if self.wedged.load(Ordering::SeqCst) {
            return Err(Error::Unreachable(format!(
                "sequence {} was never acknowledged",
                record.sequence()
            )));
        }
        self.inner.publish(topic, record).await
    }

    async fn reset_topic(&self, topic: &str) -> Result<()> {
        self.inner.reset_topic(topic).await
    }
}

#[async_trait]
impl ControlPlane for WedgedCluster {
    async fn send_signal(&self, unit: &UnitRef, signal: SignalKind) -> Result<()> {
        self.wedge().await;
        self.inner.send_signal(unit, signal).await
    }

    async fn isolate(&self, unit: &UnitRef) -> Result<()> {
        self.wedge().await;
        self.inner.isolate(unit).await
    }

    async fn restore_network(&self, unit: &UnitRef) -> Result<()> {
        self.inner.restore_network(unit).await
    }

    async fn delete_unit(&self, unit: &UnitRef) -> Result<()> {
        self.wedge().await;
        self.inner.delete_unit(unit).await
    }

    async fn set_restart_backoff(&self, unit: &UnitRef, policy: BackoffPolicy) -> Result<()> {
        self.inner.set_restart_backoff(unit, policy).await
    }

    async fn unit_address(&self, unit: &UnitRef) -> Result<String> {
        self.inner.unit_address(unit).await
    }

    async fn list_units(&self) -> Result<Vec<UnitRef>> {
        self.inner.list_units().await
    }
}

/// Orchestrator whose cluster never acknowledges a write after the fault.
pub fn wedged_after_fault(config: &HarnessConfig) -> ScenarioOrchestrator {
    let inner = Arc::new(
        SimulatedCluster::new(&config.cluster, config.simulation.clone()).with_topic(&config.topic),
    );
    let wedged = Arc::new(WedgedCluster {
        inner: inner.clone(),
        wedged: AtomicBool::new(false),
    });
    let injector = FaultInjector::new(wedged.clone(), &config.cluster);
    ScenarioOrchestrator::new(config, inner, wedged, injector)
}

/// Panic unless the scenario failed at `step` because writes never resumed.
pub fn assert_stalled_at(report: &ScenarioReport, step: kafka_ha_core::Step) {
    assert!(!report.passed, "{}", report.summary());
    assert_eq!(report.failed_step, Some(step), "{}", report.summary());
    assert!(
        report.error.as_deref().unwrap_or_default().contains("no_progress"),
        "{}",
        report.summary()
    );
    let initial = report.initial_offsets.as_ref().unwrap();
    let resumed = report.resumed_offsets.as_ref().unwrap();
    assert!(resumed.last() >= initial.last());
}
