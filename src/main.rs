use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use agent_dispatch::execution::LogLevel;
use agent_dispatch::tools::builtin::register_builtins;
use agent_dispatch::{
    Agent, AgentContext, AgentPool, EngineConfig, Task, TaskScheduler, ToolRegistry, WorkerError,
};

/// Directory for daily-rotated log files; console only when unset.
const LOG_DIR_ENV: &str = "AGENT_DISPATCH_LOG_DIR";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).boxed();

    let file = std::env::var(LOG_DIR_ENV).ok().map(PathBuf::from).and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("Warning: failed to create log directory {dir:?}: {e}");
            return None;
        }
        let appender = RollingFileAppender::new(Rotation::DAILY, &dir, "agent-dispatch.log");
        Some(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_thread_ids(true)
                .boxed(),
        )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
}

/// Pretends to summarize text with a slow model call.
struct Summarizer;

#[async_trait]
impl Agent for Summarizer {
    async fn initialize(&self) -> Result<(), WorkerError> {
        // Model load.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &AgentContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let text = payload["text"]
            .as_str()
            .ok_or_else(|| WorkerError::terminal("payload needs a 'text' field"))?;

        ctx.log("Summarizing", LogLevel::Info).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        if ctx.is_cancelled() {
            return Err(WorkerError::terminal("cancelled mid-call"));
        }
        ctx.set_progress(100).await;

        let summary: String = text.split_whitespace().take(5).collect::<Vec<_>>().join(" ");
        Ok(json!({ "summary": summary, "words": text.split_whitespace().count() }))
    }
}

/// Fails every other call with a transient error.
struct Unreliable {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for Unreliable {
    async fn execute(
        &self,
        payload: serde_json::Value,
        _ctx: &AgentContext,
    ) -> Result<serde_json::Value, WorkerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(WorkerError::transient("inference service unavailable"));
        }
        Ok(json!({ "classified": payload }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = EngineConfig::from_env()?;

    eprintln!("Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Concurrency: {}", config.scheduler.max_concurrency);
    eprintln!("   Agents per type: {}", config.pool.max_agents_per_type);
    eprintln!("   Queue: {:?} (max {})", config.queue.strategy, config.queue.max_size);

    let pool = AgentPool::new(config.pool.clone());
    pool.register_factory("summarizer", Arc::new(|| Arc::new(Summarizer) as Arc<dyn Agent>));
    let unreliable: Arc<dyn Agent> = Arc::new(Unreliable {
        calls: AtomicU32::new(0),
    });
    pool.register_factory("classifier", Arc::new(move || Arc::clone(&unreliable)));

    let tools = Arc::new(ToolRegistry::new());
    register_builtins(&tools);

    let scheduler = TaskScheduler::new(config.queue, config.scheduler.clone(), pool, tools);
    scheduler.start().await;

    let mut events = scheduler.event_stream();
    let observer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => tracing::info!(event = event.name(), "{line}"),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
            }
        }
    });

    let fetch = Task::tool("time", json!({}));
    let summarize = Task::agent(
        "summarizer",
        json!({ "text": "the quick brown fox jumps over the lazy dog" }),
    )
    .with_dependencies([fetch.id]);

    let tasks = vec![
        Task::agent("summarizer", json!({ "text": "scheduling work across a pool of agents" }))
            .with_priority(5),
        Task::agent("classifier", json!({ "subject": "invoice overdue" })).with_priority(1),
        Task::tool("echo", json!({ "message": "hello" })),
        Task::composite(vec![fetch, summarize]).with_priority(3),
        Task::agent("summarizer", json!({})),
    ];

    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        ids.push(scheduler.submit_task(task).await?);
    }
    eprintln!("   Submitted {} tasks: {:?}", ids.len(), scheduler.queue_status().await);

    for id in ids {
        match scheduler.wait_for_task(id).await {
            Some(outcome) => eprintln!("   {id}: {}", serde_json::to_string(&outcome)?),
            None => eprintln!("   {id}: no record"),
        }
    }

    eprintln!("   Pool: {}", serde_json::to_string(&scheduler.pool().stats())?);
    scheduler.shutdown().await;
    observer.abort();
    Ok(())
}
