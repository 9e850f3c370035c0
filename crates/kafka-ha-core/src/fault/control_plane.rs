//! Control plane trait definition.

use async_trait::async_trait;

use crate::model::{BackoffPolicy, SignalKind, UnitRef};
use crate::Result;

/// Deployment-level operations on the units of the cluster under test.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Deliver a signal to the unit's broker process
    async fn send_signal(&self, unit: &UnitRef, signal: SignalKind) -> Result<()>;

    /// Cut the unit off from every other member
    async fn isolate(&self, unit: &UnitRef) -> Result<()>;

    /// Remove isolation; succeeds when none is active
    async fn restore_network(&self, unit: &UnitRef) -> Result<()>;

    /// Delete the unit's pod so it is rescheduled
    async fn delete_unit(&self, unit: &UnitRef) -> Result<()>;

    /// Change how long the supervisor waits before restarting a crashed broker
    async fn set_restart_backoff(&self, unit: &UnitRef, policy: BackoffPolicy) -> Result<()>;

    /// Current network address of the unit
    async fn unit_address(&self, unit: &UnitRef) -> Result<String>;

    /// Every unit of the application
    async fn list_units(&self) -> Result<Vec<UnitRef>>;
}
