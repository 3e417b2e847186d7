//! Error handling and retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::handler::HandlerError;

use super::{
    Next, PipelineError, PipelineStep, ProcessingContext, Resolution, Result, StepDescriptor,
};

/// What the retry policy decided for a failed handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration },
    /// Reject permanently.
    Reject { reason: String },
}

/// Pluggable reaction to a handler failure.
pub trait RetryPolicy: Send + Sync {
    fn apply(
        &self,
        ctx: &ProcessingContext,
        error: &HandlerError,
    ) -> std::result::Result<RetryDecision, HandlerError>;
}

/// Default policy: reject on first failure. Retry is opt-in per endpoint.
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn apply(
        &self,
        _ctx: &ProcessingContext,
        error: &HandlerError,
    ) -> std::result::Result<RetryDecision, HandlerError> {
        Ok(RetryDecision::Reject {
            reason: error.to_string(),
        })
    }
}

/// Exponential backoff: the nth failure waits for the nth delay of the
/// schedule; an exhausted schedule rejects.
pub struct ExponentialBackoffPolicy {
    backoff: ExponentialBuilder,
}

impl ExponentialBackoffPolicy {
    pub fn new(backoff: ExponentialBuilder) -> Self {
        Self { backoff }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(config.min_delay_ms))
                .with_max_delay(Duration::from_millis(config.max_delay_ms))
                .with_max_times(config.max_retries as usize),
        )
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn apply(
        &self,
        ctx: &ProcessingContext,
        error: &HandlerError,
    ) -> std::result::Result<RetryDecision, HandlerError> {
        let attempt = ctx.message.headers().retry_count() as usize;
        match self.backoff.clone().build().nth(attempt) {
            Some(delay) => Ok(RetryDecision::Retry { delay }),
            None => Ok(RetryDecision::Reject {
                reason: format!("retries exhausted: {error}"),
            }),
        }
    }
}

/// Catches handler failures and delegates to the retry policy.
///
/// A consumed failure is recorded as the run's resolution and the message is
/// acknowledged; the unit-of-work step rolls back and performs the retry or
/// rejection. If applying the policy itself fails, the original failure is
/// propagated.
pub struct ErrorHandlingStep {
    policy: Arc<dyn RetryPolicy>,
}

impl ErrorHandlingStep {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl PipelineStep for ErrorHandlingStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor::new("error-handling")
            .after("unit-of-work")
            .after("reply-validation")
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next) -> Result<()> {
        match next.run(ctx).await {
            Ok(()) => Ok(()),
            Err(PipelineError::Handler(failure)) => {
                warn!(
                    message_id = %ctx.message.id(),
                    type_key = %ctx.message.type_key(),
                    endpoint = %ctx.endpoint,
                    error = %failure,
                    "Handler failed, applying retry policy"
                );

                match self.policy.apply(ctx, &failure) {
                    Ok(RetryDecision::Retry { delay }) => {
                        let due = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        let attempt = ctx.message.headers().retry_count() + 1;
                        ctx.resolution = Some(Resolution::Retry { due, attempt });
                        Ok(())
                    }
                    Ok(RetryDecision::Reject { reason }) => {
                        ctx.resolution = Some(Resolution::Reject { reason });
                        Ok(())
                    }
                    Err(policy_failure) => {
                        error!(
                            message_id = %ctx.message.id(),
                            error = %policy_failure,
                            "Retry policy failed, propagating original handler failure"
                        );
                        Err(PipelineError::Handler(failure))
                    }
                }
            }
            Err(other) => Err(other),
        }
    }
}
