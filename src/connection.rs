//! Bounded-retry session acquisition.

use std::time::Duration;

use log::{debug, warn};

use crate::{
    db::{Connector, StagingSession},
    error::{DbError, IngestError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Pause after failed attempt `attempt` (1-based): `base * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Hands out verified sessions from a [`Connector`].
pub struct ConnectionManager<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Connects and probes liveness, retrying with exponential backoff. After
    /// the last failed attempt no further connection is tried.
    pub async fn acquire(&self) -> Result<C::Session, IngestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.try_once().await {
                Ok(session) => {
                    debug!("database session ready after {attempt} attempt(s)");
                    return Ok(session);
                }
                Err(err) => err,
            };
            if attempt >= self.policy.max_attempts {
                return Err(IngestError::Connectivity {
                    attempts: attempt,
                    source: error,
                });
            }
            let delay = self.policy.delay_after(attempt);
            warn!(
                "database connection attempt {attempt}/{} failed: {error}; retrying in {delay:?}",
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_once(&self) -> Result<C::Session, DbError> {
        let session = self.connector.connect().await?;
        session.ping().await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(16));
    }

    #[test]
    fn zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn huge_attempt_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(64), Duration::from_secs(u64::from(u32::MAX)));
        let wide = RetryPolicy::new(5, Duration::MAX);
        assert_eq!(wide.delay_after(3), Duration::MAX);
    }
}
