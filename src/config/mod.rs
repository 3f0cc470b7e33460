pub mod error;
pub mod load;
pub mod settings;
pub mod workflow_file;

pub use error::ConfigError;
pub use load::{default_settings_path, load_settings};
pub use settings::{
    LogFormat, OverrideSettings, PollerSettings, ReminderSettings, RetrySettings, Settings,
    TracingSettings,
};
pub use workflow_file::{
    load_workflow_from_path, load_workflows_from_dir, parse_workflow_yaml, validate_workflow,
    StepDefinition, StepMode, WorkflowDefinition,
};
