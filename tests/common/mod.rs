#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trajectory_runner::{
    Action, BrowserPool, BrowserSession, DispatchError, ExecutorConfig, Gateway, InferenceService,
    Locality, ModelDescriptor, ModelRequest, ModelResponse, PoolConfig, ProtocolKind, RunSummary,
    ServiceError, SessionFactory, StoreError, TaskAttemptResult, TaskSpec, TrajectoryExecutor,
    TrajectorySink,
};

pub type Reply = Result<ModelResponse, ServiceError>;

// ========================= Models =========================

pub fn local_text(id: &str) -> ModelDescriptor {
    ModelDescriptor::new(id, "ui-tars", "http://localhost:8000/v1", Locality::Local, ProtocolKind::TextGrammar)
}

pub fn remote_text(id: &str) -> ModelDescriptor {
    ModelDescriptor::new(id, "doubao", "https://example.invalid/v1", Locality::Remote, ProtocolKind::TextGrammar)
}

pub fn remote_object(id: &str) -> ModelDescriptor {
    ModelDescriptor::new(id, "computer-use-preview", "https://example.invalid/v1", Locality::Remote, ProtocolKind::StructuredObject)
}

pub fn task(id: &str, max_steps: usize) -> TaskSpec {
    TaskSpec {
        id: id.into(),
        description: format!("Do {id}"),
        success_criteria: "It is done".into(),
        url: "http://localhost/app.html".into(),
        max_steps: Some(max_steps),
    }
}

// ========================= Replies =========================

pub fn text(s: &str) -> Reply {
    Ok(ModelResponse::Text(s.to_string()))
}

pub fn click_text(x: i64, y: i64) -> Reply {
    text(&format!("Thought: press it\nAction: click(point='<point>{x} {y}</point>')"))
}

pub fn finished_text() -> Reply {
    text("Thought: all good\nAction: finished(content='success')")
}

pub fn rate_limited() -> Reply {
    Err(ServiceError::RateLimited("429 Too Many Requests".into()))
}

pub fn transport() -> Reply {
    Err(ServiceError::Transport("connection reset".into()))
}

/// Responses API payload holding one computer_call.
pub fn computer_call(response_id: &str, call_id: &str, action: Value) -> Reply {
    Ok(ModelResponse::Object(json!({
        "id": response_id,
        "output": [
            { "type": "reasoning", "summary": [{ "type": "summary_text", "text": "next move" }] },
            { "type": "computer_call", "call_id": call_id, "action": action, "pending_safety_checks": [] }
        ]
    })))
}

// ========================= Inference =========================

#[derive(Default)]
pub struct ScriptedService {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<HashMap<String, Reply>>,
    pub requests: Mutex<Vec<(String, ModelRequest)>>,
    pub delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    /// Replies played in order for `model`.
    pub fn script(self, model: &str, replies: Vec<Reply>) -> Self {
        self.scripts.lock().unwrap().insert(model.to_string(), replies.into());
        self
    }

    /// Reply used once the script for `model` runs out.
    pub fn always(self, model: &str, reply: Reply) -> Self {
        self.fallback.lock().unwrap().insert(model.to_string(), reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|(m, _)| m == model).count()
    }

    pub fn request(&self, i: usize) -> ModelRequest {
        self.requests.lock().unwrap()[i].1.clone()
    }
}

#[async_trait]
impl InferenceService for ScriptedService {
    async fn complete(&self, model: &ModelDescriptor, request: &ModelRequest) -> Reply {
        self.requests.lock().unwrap().push((model.id.clone(), request.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.scripts.lock().unwrap().get_mut(&model.id).and_then(|q| q.pop_front());
        match scripted {
            Some(reply) => reply,
            None => self
                .fallback
                .lock()
                .unwrap()
                .get(&model.id)
                .cloned()
                .unwrap_or_else(|| Err(ServiceError::Transport("script exhausted".into()))),
        }
    }
}

// ========================= Browser =========================

#[derive(Default)]
pub struct FakeState {
    pub fail_screenshot: bool,
    pub fail_clicks: bool,
    pub fail_close: bool,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub navigations: AtomicUsize,
    pub actions: Mutex<Vec<Action>>,
}

pub struct FakeSession {
    pub serial: usize,
    state: Arc<FakeState>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&self, _url: &str) -> Result<(), DispatchError> {
        self.state.navigations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn act(&self, action: &Action) -> Result<String, DispatchError> {
        self.state.actions.lock().unwrap().push(action.clone());
        if self.state.fail_clicks && matches!(action, Action::Click { .. }) {
            return Err(DispatchError::Action("element is not clickable".into()));
        }
        Ok(format!("did {action}"))
    }

    async fn screenshot(&self) -> Result<String, DispatchError> {
        if self.state.fail_screenshot {
            return Err(DispatchError::Timeout("screenshot", Duration::from_secs(30)));
        }
        Ok("iVBORw0KGgo=".to_string())
    }

    async fn close(&mut self) -> Result<(), DispatchError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close {
            return Err(DispatchError::Close("target crashed".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    pub state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new(state: FakeState) -> Self {
        Self { state: Arc::new(state) }
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self) -> Result<FakeSession, DispatchError> {
        let serial = self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession { serial, state: self.state.clone() })
    }
}

// ========================= Persistence =========================

#[derive(Default)]
pub struct MemorySink {
    pub results: Mutex<Vec<TaskAttemptResult>>,
    pub summaries: Mutex<Vec<RunSummary>>,
    pub screenshots: AtomicUsize,
}

#[async_trait]
impl TrajectorySink for MemorySink {
    async fn record_screenshot(&self, _m: &str, _t: &str, _step: usize, _png: &str) -> Result<(), StoreError> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_result(&self, result: &TaskAttemptResult) -> Result<(), StoreError> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

// ========================= Wiring =========================

pub struct Harness {
    pub service: Arc<ScriptedService>,
    pub factory: FakeFactory,
    pub pool: Arc<BrowserPool<FakeFactory>>,
    pub sink: Arc<MemorySink>,
    pub executor: Arc<TrajectoryExecutor<FakeFactory>>,
}

impl Harness {
    pub fn new(service: ScriptedService, factory: FakeFactory) -> Self {
        Self::with_pool(service, factory, PoolConfig { idle_capacity: 3, max_live: 5 })
    }

    pub fn with_pool(service: ScriptedService, factory: FakeFactory, pool: PoolConfig) -> Self {
        let service = Arc::new(service);
        let pool = Arc::new(BrowserPool::new(factory.clone(), pool));
        let gateway = Arc::new(Gateway::new(service.clone(), Duration::ZERO));
        let sink = Arc::new(MemorySink::default());
        let executor = Arc::new(TrajectoryExecutor::new(
            pool.clone(),
            gateway,
            sink.clone(),
            ExecutorConfig { max_steps: 10, viewport: (1280, 720) },
        ));
        Self { service, factory, pool, sink, executor }
    }
}
