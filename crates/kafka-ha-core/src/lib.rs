//! Kafka HA Core Library
//!
//! This crate validates the high-availability guarantees of a Kafka cluster:
//! it writes a numbered record stream while brokers are killed, frozen,
//! restarted, rescheduled or cut off from the network, then checks that no
//! acknowledged record was lost, offsets only moved forward and the ISR
//! converged back to the full replica set.

pub mod checker;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fault;
pub mod kafka;
pub mod model;
pub mod observer;
pub mod scenario;
pub mod writes;

pub use checker::{ConsistencyChecker, ConsistencyResult, TolerancePolicy, Violation};
pub use cluster::{ClusterQuery, KafkaCluster, RecordPublisher, SimulatedCluster, SimulationProfile};
pub use config::{
    ControlPlaneConfig, HarnessConfig, KafkaConfig, ObserverOptions, ScenarioTimings, TopicConfig,
    WriteOptions,
};
pub use error::{Error, ErrorKind, KafkaError, Result};
pub use fault::{ControlPlane, FaultInjector, HostsFile, KubectlControlPlane, NameResolver, PerturbationHandle};
pub use model::{
    BackoffPolicy, OffsetSnapshot, Perturbation, PublishAck, Record, ReplicaId, SignalKind,
    TopicDescription, UnitRef, WriteFailure, WriteSessionReport,
};
pub use observer::ClusterObserver;
pub use scenario::{Scenario, ScenarioOrchestrator, ScenarioPlan, ScenarioReport, Step};
pub use writes::{ContinuousWriteSession, WriteProgress};
