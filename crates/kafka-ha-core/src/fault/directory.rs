//! ReplicaId <-> unit mapping.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use super::ControlPlane;
use crate::model::{ReplicaId, UnitRef};
use crate::{Error, Result};

/// Translates broker ids to deployment units and caches unit addresses.
///
/// The address cache is dropped whenever a unit is replaced; the next lookup
/// re-derives it from the control plane.
pub struct UnitDirectory {
    app: String,
    broker_id_offset: i32,
    addresses: RwLock<Option<BTreeMap<UnitRef, String>>>,
}

impl UnitDirectory {
    pub fn new(app: impl Into<String>, broker_id_offset: i32) -> Self {
        Self {
            app: app.into(),
            broker_id_offset,
            addresses: RwLock::new(None),
        }
    }

    /// Unit hosting a replica (`unit_index = replica_id - broker_id_offset`).
    pub fn unit_for(&self, replica: ReplicaId) -> Result<UnitRef> {
        let index = replica.0 - self.broker_id_offset;
        if index < 0 {
            return Err(Error::NotFound(format!(
                "replica {} is below broker id offset {}",
                replica, self.broker_id_offset
            )));
        }
        Ok(UnitRef::new(self.app.clone(), index as u32))
    }

    pub fn replica_for(&self, unit: &UnitRef) -> ReplicaId {
        ReplicaId(self.broker_id_offset + unit.index as i32)
    }

    /// Unit hosting a replica, checked against the live unit list.
    pub async fn resolve(
        &self,
        control_plane: &dyn ControlPlane,
        replica: ReplicaId,
    ) -> Result<UnitRef> {
        let unit = self.unit_for(replica)?;
        if control_plane.list_units().await?.contains(&unit) {
            Ok(unit)
        } else {
            Err(Error::NotFound(format!("unit {} for replica {}", unit, replica)))
        }
    }

    /// Address of every unit, re-derived from the control plane after an invalidation.
    pub async fn addresses(
        &self,
        control_plane: &dyn ControlPlane,
    ) -> Result<BTreeMap<UnitRef, String>> {
        if let Some(cached) = self.addresses.read().as_ref() {
            return Ok(cached.clone());
        }

        let mut addresses = BTreeMap::new();
        for unit in control_plane.list_units().await? {
            let address = control_plane.unit_address(&unit).await?;
            debug!("Unit {} is at {}", unit, address);
            addresses.insert(unit, address);
        }
        *self.addresses.write() = Some(addresses.clone());
        Ok(addresses)
    }

    pub fn invalidate(&self) {
        *self.addresses.write() = None;
    }

    pub fn is_cached(&self) -> bool {
        self.addresses.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_unit_translation() {
        let directory = UnitDirectory::new("kafka-k8s", 100);
        let unit = directory.unit_for(ReplicaId(102)).unwrap();
        assert_eq!(unit, UnitRef::new("kafka-k8s", 2));
        assert_eq!(directory.replica_for(&unit), ReplicaId(102));
        assert!(directory.unit_for(ReplicaId(7)).is_err());
    }
}
