use super::{Capability, CapabilityError, Completion, SharedCapability};
use crate::config::RetrySettings;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(8),
            ],
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            delays: settings
                .delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt `attempt` (0-based). The last delay repeats.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt as usize)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Retries transient failures of the wrapped capability with fixed delays.
pub struct RetryingCapability {
    inner: SharedCapability,
    policy: RetryPolicy,
}

impl RetryingCapability {
    pub fn new(inner: SharedCapability, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Wrap `inner` as a shared capability.
    pub fn wrap(inner: SharedCapability, policy: RetryPolicy) -> SharedCapability {
        Arc::new(Self::new(inner, policy))
    }
}

#[async_trait]
impl Capability for RetryingCapability {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        image: Option<&str>,
    ) -> Result<Completion, CapabilityError> {
        let mut attempt = 0_u32;
        loop {
            match self
                .inner
                .complete(system_prompt, user_message, image)
                .await
            {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        capability = self.inner.id(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient capability failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(capability = self.inner.id(), error = %err, "capability call failed");
                    return Err(err);
                }
            }
        }
    }

    async fn validate_key(&self) -> bool {
        self.inner.validate_key().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
