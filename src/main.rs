use std::panic;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use judge_evaluator::{
    config::AppConfig,
    core::evaluator::Evaluator,
    fixtures::DiskTestManager,
    memory::{MemoryStores, Seed},
    native::NativeSandboxManager,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    set_panic_hook();

    let stores = match &config.evaluator.seed_path {
        Some(path) => {
            let seed = Seed::load(path).await?;
            tracing::info!(
                path = %path.display(),
                problems = seed.problems.len(),
                tests = seed.tests.len(),
                submissions = seed.submissions.len(),
                "Loaded seed data"
            );
            MemoryStores::from_seed(seed)
        }
        None => MemoryStores::new(),
    };
    let services = stores.services_with(Arc::new(DiskTestManager::new(&config.fixtures.root)));

    let sandbox = NativeSandboxManager::new(config.sandbox.clone(), &config.evaluator.output_path)?;
    let evaluator = Evaluator::new(&config, services, Arc::new(sandbox))?;

    evaluator
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.evaluator.log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
