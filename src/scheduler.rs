//! Runs the (model x task) matrix under a global concurrency cap.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::agent::{Outcome, TaskAttemptResult, TaskSpec, TrajectoryExecutor};
use crate::config::ModelDescriptor;
use crate::session::SessionFactory;
use crate::store::TrajectorySink;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub max_steps: usize,
    pub fatal: usize,
    pub results: Vec<TaskAttemptResult>,
}

impl RunSummary {
    pub fn from_results(results: Vec<TaskAttemptResult>) -> Self {
        let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            total: results.len(),
            completed: count(Outcome::Completed),
            max_steps: count(Outcome::MaxStepsReached),
            fatal: count(Outcome::FatalError),
            results,
        }
    }

    pub fn get(&self, model: &str, task_id: &str) -> Option<&TaskAttemptResult> {
        self.results.iter().find(|r| r.model == model && r.task_id == task_id)
    }
}

pub struct Scheduler<F: SessionFactory + 'static> {
    executor: Arc<TrajectoryExecutor<F>>,
    sink: Arc<dyn TrajectorySink>,
    max_concurrent: usize,
}

impl<F: SessionFactory + 'static> Scheduler<F> {
    pub fn new(
        executor: Arc<TrajectoryExecutor<F>>,
        sink: Arc<dyn TrajectorySink>,
        max_concurrent: usize,
    ) -> Self {
        Self { executor, sink, max_concurrent: max_concurrent.max(1) }
    }

    /// One attempt per (model, task) pair, restricted to `valid` when given
    /// as `(model id, task id)` pairs. Results come back in matrix order.
    pub async fn run(
        &self,
        models: &[ModelDescriptor],
        tasks: &[TaskSpec],
        valid: Option<&HashSet<(String, String)>>,
    ) -> RunSummary {
        let slots = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::new();
        for model in models {
            for task in tasks {
                if let Some(valid) = valid {
                    if !valid.contains(&(model.id.clone(), task.id.clone())) {
                        continue;
                    }
                }
                let (executor, slots) = (self.executor.clone(), slots.clone());
                let (model, task) = (model.clone(), task.clone());
                let key = (model.id.clone(), task.id.clone());
                let handle = tokio::spawn(async move {
                    let _permit = match slots.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return TaskAttemptResult::fatal(&model.id, &task.id, "scheduler closed"),
                    };
                    executor.execute(&model, &task).await
                });
                handles.push((key, handle));
            }
        }
        info!(attempts = handles.len(), max_concurrent = self.max_concurrent, "scheduled attempts");

        let mut results = Vec::with_capacity(handles.len());
        for ((model, task), handle) in handles {
            match handle.await {
                Ok(r) => results.push(r),
                Err(e) => {
                    error!(model = %model, task = %task, error = %e, "attempt panicked");
                    results.push(TaskAttemptResult::fatal(&model, &task, format!("attempt aborted: {e}")));
                }
            }
        }

        let summary = RunSummary::from_results(results);
        info!(
            total = summary.total,
            completed = summary.completed,
            max_steps = summary.max_steps,
            fatal = summary.fatal,
            "run finished"
        );
        if let Err(e) = self.sink.write_summary(&summary).await {
            warn!(error = %e, "persisting run summary failed");
        }
        summary
    }
}
