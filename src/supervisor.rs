//! Contract to the local process supervisor that actually runs units.
//!
//! The production implementation (systemd or similar) lives out of tree;
//! [`FakeUnitManager`] is part of the core test surface and backs
//! standalone mode.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::unit::{Unit, UnitState};

#[async_trait]
pub trait UnitManager: Send + Sync {
    /// Make the unit known to the supervisor under the given name.
    async fn load(&self, name: &str, unit: Unit) -> Result<()>;

    /// Forget the named unit. A no-op when the unit is not loaded.
    async fn unload(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Names of all loaded units, sorted.
    async fn units(&self) -> Result<Vec<String>>;

    /// State of one unit, None when not loaded.
    async fn unit_state(&self, name: &str) -> Result<Option<UnitState>>;

    /// States for the requested subset of units; absent units are skipped.
    async fn unit_states(&self, names: &HashSet<String>)
        -> Result<BTreeMap<String, UnitState>>;
}

#[derive(Debug, Clone)]
struct FakeUnit {
    #[allow(dead_code)]
    unit: Unit,
    state: UnitState,
}

/// In-memory supervisor. After `load` a unit reports
/// `{loaded, active, running}`; `stop` flips it to
/// `{loaded, inactive, dead}`; `unload` removes it entirely.
#[derive(Default)]
pub struct FakeUnitManager {
    units: RwLock<BTreeMap<String, FakeUnit>>,
}

impl FakeUnitManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnitManager for FakeUnitManager {
    async fn load(&self, name: &str, unit: Unit) -> Result<()> {
        let mut units = self.units.write().await;
        units.insert(
            name.to_string(),
            FakeUnit {
                unit,
                state: UnitState::new("loaded", "active", "running"),
            },
        );
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<()> {
        self.units.write().await.remove(name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        if let Some(fu) = self.units.write().await.get_mut(name) {
            fu.state = UnitState::new("loaded", "active", "running");
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if let Some(fu) = self.units.write().await.get_mut(name) {
            fu.state = UnitState::new("loaded", "inactive", "dead");
        }
        Ok(())
    }

    async fn units(&self) -> Result<Vec<String>> {
        Ok(self.units.read().await.keys().cloned().collect())
    }

    async fn unit_state(&self, name: &str) -> Result<Option<UnitState>> {
        Ok(self.units.read().await.get(name).map(|fu| fu.state.clone()))
    }

    async fn unit_states(
        &self,
        names: &HashSet<String>,
    ) -> Result<BTreeMap<String, UnitState>> {
        let units = self.units.read().await;
        Ok(units
            .iter()
            .filter(|(name, _)| names.contains(*name))
            .map(|(name, fu)| (name.clone(), fu.state.clone()))
            .collect())
    }
}
