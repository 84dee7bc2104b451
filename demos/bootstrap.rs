//! Bootstrap example using ferrous-conductor
//!
//! This example demonstrates a small service graph brought up and torn down
//! in dependency order:
//! - Explicit dependency declarations and priorities
//! - Batched, bounded-parallel initialization
//! - A flaky component recovering through retries
//! - A non-critical component failing without stopping startup
//! - Health checks and reverse-order shutdown
//!
//! Run with `RUST_LOG=ferrous_conductor=debug cargo run --example bootstrap`.

use ferrous_conductor::{
    async_trait, BackoffStrategy, CancellationToken, Component, Container, Dependencies, DiResult,
    EngineConfig, Factory, Key, LifecycleContext, Outcome, RecordingObserver, ServiceDescriptor,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

// ===== Domain Components =====

struct Settings {
    database_url: String,
}

struct Database {
    url: String,
    connects: AtomicU32,
}

#[async_trait]
impl Component for Database {
    async fn initialize(&self, ctx: &LifecycleContext) -> Outcome {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if n < 2 {
            tracing::info!(url = %self.url, attempt = ctx.attempt(), "database not ready yet");
            return Outcome::transient("connection refused");
        }
        tracing::info!(url = %self.url, attempt = ctx.attempt(), "database connected");
        Outcome::Success
    }

    async fn shutdown(&self, _ctx: &LifecycleContext) -> Outcome {
        tracing::info!("database pool closed");
        Outcome::Success
    }
}

struct Metrics;

#[async_trait]
impl Component for Metrics {
    async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
        Outcome::transient("metrics endpoint unreachable")
    }
}

struct UserRepository {
    db: Arc<Database>,
}

#[async_trait]
impl Component for UserRepository {
    async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
        tracing::info!(url = %self.db.url, "user repository ready");
        Outcome::Success
    }
}

struct Api {
    users: Arc<UserRepository>,
}

#[async_trait]
impl Component for Api {
    async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
        tracing::info!(database = %self.users.db.url, "api listening");
        Outcome::Success
    }

    async fn health_check(&self) -> Outcome {
        Outcome::Success
    }
}

// ===== Wiring =====

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn register(container: &Container) -> DiResult<()> {
    container.register_singleton(
        "settings",
        Dependencies::none(),
        0,
        Factory::instance(Settings {
            database_url: "postgres://localhost/app".into(),
        }),
    )?;
    container.register_singleton(
        "db",
        Dependencies::on(["settings"]),
        10,
        Factory::component(|ctx| {
            let settings = ctx.get::<Settings>("settings")?;
            Ok(Database {
                url: settings.database_url.clone(),
                connects: AtomicU32::new(0),
            })
        }),
    )?;
    container.register(
        ServiceDescriptor::singleton("metrics", Factory::component(|_| Ok(Metrics))).non_critical(),
    )?;
    container.register_singleton(
        "users",
        Dependencies::new().require("db").optional("metrics"),
        0,
        Factory::component(|ctx| Ok(UserRepository { db: ctx.get("db")? })),
    )?;
    container.register_singleton(
        "api",
        Dependencies::on(["users"]),
        0,
        Factory::component(|ctx| Ok(Api { users: ctx.get("users")? })),
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = EngineConfig::builder()
        .max_parallelism(4)
        .default_timeout(Duration::from_secs(5))
        .retry_strategy(BackoffStrategy::Exponential)
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .abort_on_batch_failure(true)
        .build()?;
    let container = Container::with_config(config)?;
    let recorder = Arc::new(RecordingObserver::new());
    container.add_observer(recorder.clone());
    register(&container)?;

    let plan = container.plan()?;
    for (index, batch) in plan.batches().iter().enumerate() {
        let names: Vec<_> = batch.iter().map(Key::to_string).collect();
        println!("batch {index}: {}", names.join(", "));
    }

    let token = CancellationToken::new();
    let report = container.initialize_all(&token).await?;
    println!("\ninitialized in {:?}", report.elapsed);
    for component in &report.components {
        println!(
            "  {:<10} {:<14} attempts={} errors={}",
            component.key.to_string(),
            component.state.to_string(),
            component.attempts,
            component.errors.len()
        );
    }

    let api = container.resolve_as::<Api>(&Key::named("api"))?;
    println!("\napi talks to {}", api.users.db.url);

    let health = container.health_check_all(&token).await;
    println!("healthy: {}", health.is_healthy());

    let shutdown = container.shutdown_all(&token).await;
    let stopped: Vec<_> = shutdown.stopped().iter().map(Key::to_string).collect();
    println!("stopped: {}", stopped.join(" -> "));
    println!("{} lifecycle events recorded", recorder.events().len());
    Ok(())
}
