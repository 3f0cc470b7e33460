use crate::provider::CapabilityError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unit `{name}` is not registered; available: [{available}]")]
    UnknownUnit { name: String, available: String },
    #[error("unit `{name}` is already registered")]
    DuplicateUnit { name: String },
    #[error("invalid unit name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
}

/// Failure raised inside a unit of work. The runner turns it into a failed step result.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("invalid input for unit `{unit}`: {reason}")]
    InvalidInput { unit: String, reason: String },
    #[error("{0}")]
    Failed(String),
}
