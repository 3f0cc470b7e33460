pub mod background;
pub mod context;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod unit;
pub mod workflow_engine;

pub use background::TaskSupervisor;
pub use context::{ContextInputs, ExecutionContext, CONTEXT_FIELDS};
pub use error::{RegistryError, UnitError};
pub use registry::{SharedUnit, UnitRegistry};
pub use resolver::CapabilityResolver;
pub use unit::{Invocation, StepResult, UnitInput, UnitOfWork};
pub use workflow_engine::{plan_step_groups, StepGroup, WorkflowRunner};
