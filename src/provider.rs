use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod output_parse;
pub mod retry;

pub use output_parse::{extract_json, normalize_completion};
pub use retry::{RetryPolicy, RetryingCapability};

/// Structured object returned by a completion call.
pub type Completion = Map<String, Value>;

/// Status codes treated as transient by the outbound retry policy.
pub const TRANSIENT_STATUS_CODES: [u16; 4] = [429, 500, 502, 503];

#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability `{capability}` returned status {status}: {message}")]
    Status {
        capability: String,
        status: u16,
        message: String,
    },
    #[error("capability `{capability}` transport failure: {message}")]
    Transport { capability: String, message: String },
    #[error("capability `{capability}` returned an unusable response: {reason}")]
    InvalidResponse { capability: String, reason: String },
    #[error("capability `{capability}` is closed")]
    Closed { capability: String },
    #[error("failed to build capability for target `{target_id}`: {reason}")]
    Build { target_id: String, reason: String },
}

impl CapabilityError {
    /// Failures worth another attempt: rate limits, gateway errors and transport drops.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => TRANSIENT_STATUS_CODES.contains(status),
            Self::Transport { .. } => true,
            Self::InvalidResponse { .. } | Self::Closed { .. } | Self::Build { .. } => false,
        }
    }
}

/// The language-model call contract a unit of work executes against.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stable identifier of the backing model or provider target.
    fn id(&self) -> &str;

    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        image: Option<&str>,
    ) -> Result<Completion, CapabilityError>;

    async fn validate_key(&self) -> bool;

    async fn close(&self);
}

pub type SharedCapability = Arc<dyn Capability>;

/// Builds override capabilities. Every override goes through the same
/// provider and the one shared credential handed in here.
pub trait CapabilityFactory: Send + Sync {
    fn build(&self, target_id: &str, credential: &str)
        -> Result<SharedCapability, CapabilityError>;
}
