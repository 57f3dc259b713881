use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tracing::debug;

use crate::bush::Bush;
use crate::error::DirectoryError;
use crate::graph::UnitKey;

/// Directorio de unidades del proceso: qué bush ejecuta cada unidad y, para
/// las que viven en otro worker, en qué dirección atienden.
///
/// Se pasa explícitamente (`Arc<Directory>`) a quien lo necesite.
#[derive(Default)]
pub struct Directory {
    units: RwLock<HashMap<UnitKey, String>>,
    schedulers: RwLock<HashMap<String, Weak<Bush>>>,
    remotes: RwLock<HashMap<UnitKey, String>>,
}

impl Directory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_unit(&self, unit: UnitKey, scheduler: &str) -> Result<(), DirectoryError> {
        let mut units = self.units.write();
        if units.contains_key(&unit) {
            return Err(DirectoryError::UnitAlreadyRegistered(unit));
        }
        units.insert(unit, scheduler.to_string());
        debug!("unidad {unit} registrada en {scheduler}");
        Ok(())
    }

    pub fn register_scheduler(&self, id: &str, bush: &Arc<Bush>) -> Result<(), DirectoryError> {
        let mut schedulers = self.schedulers.write();
        if schedulers
            .get(id)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
        {
            return Err(DirectoryError::SchedulerAlreadyRegistered(id.to_string()));
        }
        schedulers.insert(id.to_string(), Arc::downgrade(bush));
        Ok(())
    }

    /// Dirección de una unidad remota; re-registrar la misma dirección no es error.
    pub fn register_remote(&self, unit: UnitKey, address: &str) -> Result<(), DirectoryError> {
        let mut remotes = self.remotes.write();
        match remotes.get(&unit) {
            Some(existing) if existing != address => {
                Err(DirectoryError::UnitAlreadyRegistered(unit))
            }
            _ => {
                remotes.insert(unit, address.to_string());
                Ok(())
            }
        }
    }

    pub fn lookup_unit(&self, unit: UnitKey) -> Option<String> {
        self.units.read().get(&unit).cloned()
    }

    pub fn lookup_scheduler(&self, id: &str) -> Option<Arc<Bush>> {
        self.schedulers.read().get(id).and_then(Weak::upgrade)
    }

    pub fn lookup_remote(&self, unit: UnitKey) -> Option<String> {
        self.remotes.read().get(&unit).cloned()
    }

    /// Bush local que ejecuta `unit`, si sigue vivo.
    pub fn resolve(&self, unit: UnitKey) -> Option<Arc<Bush>> {
        let scheduler = self.lookup_unit(unit)?;
        self.lookup_scheduler(&scheduler)
    }

    pub fn units_of(&self, scheduler: &str) -> Vec<UnitKey> {
        let mut units: Vec<UnitKey> = self
            .units
            .read()
            .iter()
            .filter(|(_, s)| s.as_str() == scheduler)
            .map(|(u, _)| *u)
            .collect();
        units.sort_unstable();
        units
    }

    pub fn remove_unit(&self, unit: UnitKey) {
        self.units.write().remove(&unit);
    }

    pub fn remove_scheduler(&self, id: &str) {
        self.schedulers.write().remove(id);
        self.units.write().retain(|_, s| s != id);
    }

    pub fn remove_remote(&self, unit: UnitKey) {
        self.remotes.write().remove(&unit);
    }
}
