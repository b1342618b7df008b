use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trajectory_runner::{
    BrowserPool, ChromiumSessionFactory, DiskTrajectoryStore, ExecutorConfig, Gateway,
    HttpInferenceService, Locality, ModelDescriptor, PoolConfig, ProtocolKind, RunnerConfig,
    Scheduler, TaskSpec, TrajectoryExecutor, TrajectorySink,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = RunnerConfig::from_env()?;
    let app_url = std::env::var("APP_URL").unwrap_or_else(|_| "https://example.com".into());

    let mut models = vec![ModelDescriptor::new(
        "uitars",
        "ui-tars-1.5-7b",
        std::env::var("UITARS_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/v1".into()),
        Locality::Local,
        ProtocolKind::TextGrammar,
    )];
    if std::env::var("OPENAI_API_KEY").is_ok() {
        models.push(
            ModelDescriptor::new(
                "operator",
                "computer-use-preview",
                "https://api.openai.com/v1",
                Locality::Remote,
                ProtocolKind::StructuredObject,
            )
            .with_api_key("${OPENAI_API_KEY}")
            .resolve_env()?,
        );
    }

    let tasks = vec![TaskSpec {
        id: "more-info".into(),
        description: "Open the 'More information...' link.".into(),
        success_criteria: "The IANA page about example domains is shown.".into(),
        url: app_url,
        max_steps: Some(5),
    }];

    let pool = Arc::new(BrowserPool::new(
        ChromiumSessionFactory::from_config(&cfg),
        PoolConfig { idle_capacity: cfg.pool_idle, max_live: cfg.pool_max_live },
    ));
    let service = Arc::new(HttpInferenceService::new(cfg.viewport)?);
    let gateway = Arc::new(Gateway::new(service, cfg.retry_unit));
    let sink: Arc<dyn TrajectorySink> = Arc::new(DiskTrajectoryStore::new(&cfg.artifacts_dir));
    let executor = Arc::new(TrajectoryExecutor::new(
        pool.clone(),
        gateway,
        sink.clone(),
        ExecutorConfig::from(&cfg),
    ));

    let summary = Scheduler::new(executor, sink, cfg.max_concurrent)
        .run(&models, &tasks, None)
        .await;
    pool.shutdown().await;

    println!(
        "{} attempts: {} completed, {} hit max steps, {} fatal (artifacts in {})",
        summary.total,
        summary.completed,
        summary.max_steps,
        summary.fatal,
        cfg.artifacts_dir.display()
    );
    for r in summary.results.iter().filter(|r| r.error.is_some()) {
        println!("  {}/{}: {}", r.model, r.task_id, r.error.as_deref().unwrap_or_default());
    }
    Ok(())
}
