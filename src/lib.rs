pub mod action;
pub mod agent;
pub mod browser;
pub mod config;
pub mod cua;
pub mod decode;
pub mod gateway;
pub mod pool;
pub mod prompt;
pub mod scheduler;
pub mod session;
pub mod store;

pub use action::{Action, MouseButton, NormalizationParams, Point};
pub use agent::{
    ExecutorConfig, Outcome, StepResult, TaskAttemptResult, TaskSpec, Trajectory, TrajectoryExecutor,
    TrajectoryStep,
};
pub use browser::{Browser, BrowserConfig};
pub use config::{ConfigError, ModelDescriptor, RunnerConfig};
pub use cua::HttpInferenceService;
pub use decode::{decode, DecodeError, DecodedTurn, ProtocolKind};
pub use gateway::{
    ContinuationState, Gateway, GatewayError, InferenceService, InvocationMode, Locality,
    ModelRequest, ModelResponse, ServiceError,
};
pub use pool::{BrowserPool, PoolConfig, PoolError, PooledSession};
pub use scheduler::{RunSummary, Scheduler};
pub use session::{BrowserSession, ChromiumSession, ChromiumSessionFactory, DispatchError, SessionFactory};
pub use store::{DiskTrajectoryStore, NullTrajectoryStore, StoreError, TrajectorySink};
