use super::error::RegistryError;
use super::unit::UnitOfWork;
use crate::shared::ids::UnitName;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SharedUnit = Arc<dyn UnitOfWork>;

/// Name to unit-of-work lookup, filled once at process start.
#[derive(Default)]
pub struct UnitRegistry {
    units: BTreeMap<UnitName, SharedUnit>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: SharedUnit) -> Result<(), RegistryError> {
        let name = UnitName::parse(unit.name()).map_err(|reason| RegistryError::InvalidName {
            name: unit.name().to_string(),
            reason,
        })?;
        if self.units.contains_key(&name) {
            return Err(RegistryError::DuplicateUnit {
                name: name.to_string(),
            });
        }
        tracing::info!(unit = %name, "registered unit");
        self.units.insert(name, unit);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<SharedUnit, RegistryError> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownUnit {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.keys().map(UnitName::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
