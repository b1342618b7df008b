use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::{Action, NormalizationParams};
use crate::config::{ModelDescriptor, RunnerConfig};
use crate::decode::{decode, DecodeError, DecodedTurn};
use crate::gateway::{ContinuationState, Gateway, GatewayError, InvocationMode, ModelRequest};
use crate::pool::{BrowserPool, PoolError};
use crate::prompt::{build_prompt, PromptContext};
use crate::session::{BrowserSession, DispatchError, SessionFactory};
use crate::store::TrajectorySink;

// ========================= Core Types =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub success_criteria: String,
    pub url: String,
    /// Overrides the executor's step ceiling for this task.
    #[serde(default)]
    pub max_steps: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self { success: false, message: String::new(), error: Some(error) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub index: usize,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub result: StepResult,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of one attempt. Insertion order is chronological.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory(Vec<TrajectoryStep>);

impl Trajectory {
    pub fn push(&mut self, step: TrajectoryStep) {
        self.0.push(step);
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    MaxStepsReached,
    FatalError,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskAttemptResult {
    pub run_id: String,
    pub model: String,
    pub task_id: String,
    pub trajectory: Trajectory,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskAttemptResult {
    /// Result for an attempt that never produced a trajectory.
    pub fn fatal(model: &str, task_id: &str, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: nanoid!(),
            model: model.to_string(),
            task_id: task_id.to_string(),
            trajectory: Trajectory::default(),
            outcome: Outcome::FatalError,
            error: Some(error.into()),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Init,
    Running,
    Completed,
    MaxSteps,
    Fatal,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("could not open task page: {0}")]
    Navigation(DispatchError),
    #[error("could not observe page: {0}")]
    Screenshot(DispatchError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("no decodable action after {attempts} model call(s): {last}")]
    DecodeExhausted { attempts: u32, last: DecodeError },
}

impl ExecutorError {
    /// The session itself misbehaved and must not be handed to anyone else.
    fn poisons_session(&self) -> bool {
        matches!(self, ExecutorError::Navigation(_) | ExecutorError::Screenshot(_))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub max_steps: usize,
    pub viewport: (u32, u32),
}

impl From<&RunnerConfig> for ExecutorConfig {
    fn from(cfg: &RunnerConfig) -> Self {
        Self { max_steps: cfg.max_steps, viewport: cfg.viewport }
    }
}

// ========================= Executor =========================

/// Runs one (model, task) attempt from session checkout to persisted result.
pub struct TrajectoryExecutor<F: SessionFactory> {
    pool: Arc<BrowserPool<F>>,
    gateway: Arc<Gateway>,
    sink: Arc<dyn TrajectorySink>,
    cfg: ExecutorConfig,
}

struct Attempt<'a> {
    model: &'a ModelDescriptor,
    task: &'a TaskSpec,
    params: NormalizationParams,
    max_steps: usize,
    state: ExecutorState,
    trajectory: Trajectory,
    /// Reset for every attempt; never shared.
    continuation: Option<ContinuationState>,
}

impl Attempt<'_> {
    fn transition(&mut self, next: ExecutorState) {
        debug!(model = %self.model.id, task = %self.task.id, from = ?self.state, to = ?next, "executor state");
        self.state = next;
    }
}

impl<F: SessionFactory> TrajectoryExecutor<F> {
    pub fn new(
        pool: Arc<BrowserPool<F>>,
        gateway: Arc<Gateway>,
        sink: Arc<dyn TrajectorySink>,
        cfg: ExecutorConfig,
    ) -> Self {
        Self { pool, gateway, sink, cfg }
    }

    /// Never fails: every error ends up in the returned result.
    pub async fn execute(&self, model: &ModelDescriptor, task: &TaskSpec) -> TaskAttemptResult {
        let run_id = nanoid!();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut attempt = Attempt {
            model,
            task,
            params: model.normalization(self.cfg.viewport),
            max_steps: task.max_steps.unwrap_or(self.cfg.max_steps).max(1),
            state: ExecutorState::Init,
            trajectory: Trajectory::default(),
            continuation: None,
        };
        info!(run_id = %run_id, model = %model.id, task = %task.id, max_steps = attempt.max_steps, "attempt started");

        let res = match self.pool.acquire().await {
            Err(e) => Err(ExecutorError::from(e)),
            Ok(session) => {
                attempt.transition(ExecutorState::Running);
                let res = self.drive(&session, &mut attempt).await;
                match &res {
                    Err(e) if e.poisons_session() => self.pool.discard(session).await,
                    _ => self.pool.release(session).await,
                }
                res
            }
        };

        let (outcome, error) = match res {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                attempt.transition(ExecutorState::Fatal);
                warn!(model = %model.id, task = %task.id, error = %e, "attempt failed");
                (Outcome::FatalError, Some(e.to_string()))
            }
        };

        let result = TaskAttemptResult {
            run_id,
            model: model.id.clone(),
            task_id: task.id.clone(),
            trajectory: attempt.trajectory,
            outcome,
            error,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            model = %model.id,
            task = %task.id,
            outcome = ?result.outcome,
            steps = result.trajectory.len(),
            duration_ms = result.duration_ms,
            "attempt finished"
        );
        if let Err(e) = self.sink.write_result(&result).await {
            warn!(model = %model.id, task = %task.id, error = %e, "persisting attempt failed");
        }
        result
    }

    async fn drive(
        &self,
        session: &F::Session,
        attempt: &mut Attempt<'_>,
    ) -> Result<Outcome, ExecutorError> {
        let (model, task) = (attempt.model, attempt.task);
        session.navigate(&task.url).await.map_err(ExecutorError::Navigation)?;

        for index in 0..attempt.max_steps {
            let screenshot = session.screenshot().await.map_err(ExecutorError::Screenshot)?;
            if let Err(e) = self.sink.record_screenshot(&model.id, &task.id, index, &screenshot).await {
                warn!(model = %model.id, task = %task.id, step = index, error = %e, "saving screenshot failed");
            }

            let prompt = build_prompt(
                model.protocol,
                &PromptContext {
                    task,
                    history: attempt.trajectory.steps(),
                    current_step: index + 1,
                    max_steps: attempt.max_steps,
                },
                &attempt.params,
            );
            let request = ModelRequest {
                prompt,
                images: vec![screenshot],
                mode: InvocationMode::from_state(attempt.continuation.as_ref()),
            };

            let turn = self.next_turn(model, &request, &attempt.params).await?;
            info!(step = index, model = %model.id, task = %task.id, action = %turn.action, "agent step");

            let result = match session.act(&turn.action).await {
                Ok(message) => StepResult::ok(message),
                Err(e) => {
                    warn!(step = index, model = %model.id, task = %task.id, error = %e, "action failed");
                    StepResult::failed(e.to_string())
                }
            };
            let terminated = turn.action.is_terminate();
            attempt.trajectory.push(TrajectoryStep {
                index,
                action: turn.action,
                thought: turn.thought,
                result,
                timestamp: Utc::now(),
            });
            if let Some(next) = turn.continuation {
                attempt.continuation = Some(next);
            }

            if terminated {
                attempt.transition(ExecutorState::Completed);
                return Ok(Outcome::Completed);
            }
        }
        attempt.transition(ExecutorState::MaxSteps);
        Ok(Outcome::MaxStepsReached)
    }

    /// Calls the model until its output decodes. Failed decodes record
    /// nothing; the number of calls is capped by the model's retry ceiling.
    async fn next_turn(
        &self,
        model: &ModelDescriptor,
        request: &ModelRequest,
        params: &NormalizationParams,
    ) -> Result<DecodedTurn, ExecutorError> {
        let ceiling = self.gateway.policy_for(model).attempt_ceiling();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let raw = self.gateway.invoke(model, request).await?;
            match decode(&raw, model.protocol, params) {
                Ok(turn) => return Ok(turn),
                Err(e) => {
                    warn!(model = %model.id, attempt = attempts, error = %e, preview = %raw.preview(200), "undecodable model output");
                    if ceiling.is_some_and(|max| attempts >= max) {
                        return Err(ExecutorError::DecodeExhausted { attempts, last: e });
                    }
                }
            }
        }
    }
}
