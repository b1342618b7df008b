//! Model Call Gateway: one entry point for every model invocation, with a
//! retry policy chosen by the model's locality.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ModelDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    /// Served on our own hardware; assumed to come back eventually.
    Local,
    /// Hosted API; rate limited.
    Remote,
}

/// Server-side context handle for stateful continuation protocols.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuationState {
    pub last_turn_id: String,
    pub last_pending_call_id: String,
    #[serde(default)]
    pub pending_safety_checks: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InvocationMode {
    /// Fresh context: prompt plus images.
    Initial,
    /// Resume server-held context; the images carry the pending call's result.
    Continuation(ContinuationState),
}

impl InvocationMode {
    pub fn from_state(state: Option<&ContinuationState>) -> Self {
        match state {
            Some(s) => InvocationMode::Continuation(s.clone()),
            None => InvocationMode::Initial,
        }
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, InvocationMode::Continuation(_))
    }
}

#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub prompt: String,
    /// Base64 encoded PNG screenshots.
    pub images: Vec<String>,
    pub mode: InvocationMode,
}

/// Raw, uninterpreted model output.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelResponse {
    Text(String),
    Object(Value),
}

impl ModelResponse {
    pub fn is_empty(&self) -> bool {
        match self {
            ModelResponse::Text(t) => t.trim().is_empty(),
            ModelResponse::Object(v) => v.is_null(),
        }
    }

    pub fn preview(&self, max: usize) -> String {
        let s = match self {
            ModelResponse::Text(t) => t.clone(),
            ModelResponse::Object(v) => v.to_string(),
        };
        s.chars().take(max).collect()
    }
}

/// Failure reported by an inference service for one call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("empty response")]
    EmptyResponse,
}

impl ServiceError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ServiceError::RateLimited(_))
            || matches!(self, ServiceError::Status { status: 429, .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("{model}: gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        model: String,
        attempts: u32,
        last: ServiceError,
    },
}

/// Reaches one model. Implementations must report rate limits as
/// [`ServiceError::RateLimited`] (or a 429 status).
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ServiceError>;
}

#[async_trait]
impl<T: InferenceService + ?Sized> InferenceService for Arc<T> {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ServiceError> {
        (**self).complete(model, request).await
    }
}

// ========================= Retry policies =========================

/// Per-call bookkeeping; never shared between calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub generic_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

pub trait RetryPolicy: Send + Sync {
    /// Called after a failed attempt; `state.attempts` already counts it.
    fn on_error(&self, state: &mut RetryState, err: &ServiceError) -> RetryDecision;

    /// Total attempts allowed, `None` when unbounded.
    fn attempt_ceiling(&self) -> Option<u32>;
}

/// Retries every error class forever with a linearly growing, capped delay:
/// `min(2 + attempt / 2, 10)` units.
#[derive(Clone, Copy, Debug)]
pub struct UnboundedRetry {
    pub unit: Duration,
}

impl UnboundedRetry {
    pub const CAP_UNITS: f64 = 10.0;

    pub fn delay(&self, attempt: u32) -> Duration {
        let units = (2.0 + f64::from(attempt) * 0.5).min(Self::CAP_UNITS);
        self.unit.mul_f64(units)
    }
}

impl RetryPolicy for UnboundedRetry {
    fn on_error(&self, state: &mut RetryState, _err: &ServiceError) -> RetryDecision {
        RetryDecision::RetryAfter(self.delay(state.attempts))
    }

    fn attempt_ceiling(&self) -> Option<u32> {
        None
    }
}

/// At most `max_attempts` calls. Rate limits back off exponentially from one
/// unit; any other error gets a single generic retry.
#[derive(Clone, Copy, Debug)]
pub struct BoundedRetry {
    pub unit: Duration,
    pub max_attempts: u32,
    pub generic_retries: u32,
}

impl BoundedRetry {
    pub const MAX_ATTEMPTS: u32 = 5;

    pub fn new(unit: Duration) -> Self {
        Self { unit, max_attempts: Self::MAX_ATTEMPTS, generic_retries: 1 }
    }

    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.unit * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl RetryPolicy for BoundedRetry {
    fn on_error(&self, state: &mut RetryState, err: &ServiceError) -> RetryDecision {
        if state.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if err.is_rate_limit() {
            return RetryDecision::RetryAfter(self.rate_limit_delay(state.attempts));
        }
        if state.generic_retries < self.generic_retries {
            state.generic_retries += 1;
            return RetryDecision::RetryAfter(self.unit);
        }
        RetryDecision::GiveUp
    }

    fn attempt_ceiling(&self) -> Option<u32> {
        Some(self.max_attempts)
    }
}

impl Locality {
    pub fn retry_policy(self, unit: Duration) -> Box<dyn RetryPolicy> {
        match self {
            Locality::Local => Box::new(UnboundedRetry { unit }),
            Locality::Remote => Box::new(BoundedRetry::new(unit)),
        }
    }
}

// ========================= Gateway =========================

pub struct Gateway {
    service: Arc<dyn InferenceService>,
    unit: Duration,
}

impl Gateway {
    /// `unit` is the base time unit of every backoff delay.
    pub fn new(service: Arc<dyn InferenceService>, unit: Duration) -> Self {
        Self { service, unit }
    }

    pub fn policy_for(&self, model: &ModelDescriptor) -> Box<dyn RetryPolicy> {
        model.locality.retry_policy(self.unit)
    }

    pub async fn invoke(
        &self,
        model: &ModelDescriptor,
        request: &ModelRequest,
    ) -> Result<ModelResponse, GatewayError> {
        let policy = self.policy_for(model);
        let mut state = RetryState::default();
        loop {
            state.attempts += 1;
            let err = match self.service.complete(model, request).await {
                Ok(resp) if resp.is_empty() => ServiceError::EmptyResponse,
                Ok(resp) => {
                    debug!(model = %model.id, attempt = state.attempts, preview = %resp.preview(200), "model responded");
                    return Ok(resp);
                }
                Err(e) => e,
            };
            match policy.on_error(&mut state, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        model = %model.id,
                        attempt = state.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "model call failed, retrying"
                    );
                    sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(model = %model.id, attempts = state.attempts, error = %err, "model call failed for good");
                    return Err(GatewayError::Exhausted {
                        model: model.id.clone(),
                        attempts: state.attempts,
                        last: err,
                    });
                }
            }
        }
    }
}
