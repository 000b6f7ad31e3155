#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod startup_health;

use discovery_core::{
    Registry, RegistryState,
    config::{
        cli::{self, Parser},
        trace,
    },
    coordination::{Coordinator, MemoryTree},
    tokio::{self, runtime::Builder, signal, sync::mpsc, task::JoinHandle},
    tracing::*,
};
use external_api::{ExternalApi, Health};
use startup_health::verify_startup_subsystems;
use tracing_futures::Instrument;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.chanreg_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    let span = info_span!("chanreg", host = %config.host);
    // errors exit non-zero so a supervisor restarts us with a fresh session
    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }.instrument(span)).await {
            Err(err) => Err(anyhow!(err).context("failed to start server")),
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    info!("starting in standalone mode (in-process coordination tree)");
    let tree = MemoryTree::new();
    let session = tree
        .connect(&config.connect_policy())
        .await
        .context("coordination service unreachable")?;
    let session: Arc<dyn Coordinator> = Arc::new(session);

    let registry = Registry::open(session, config.registry_options())
        .await
        .context("failed to open registry")?;

    // start external api for healthchecks and discovery
    let api = ExternalApi::new(config.external_api, Arc::clone(&registry));
    let api_sender = api.sender();
    let mut api_task = api.start();

    let token = CancellationToken::new();
    let mut monitor =
        spawn_registry_monitor_task(Arc::clone(&registry), api_sender.clone(), token.clone());

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut api_task, &mut monitor, &registry).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        close(&registry).await;
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let result = tokio::select! {
        res = shutdown_signal(token.clone()) => {
            info!("shutdown signal received");
            res
        }
        res = flatten(&mut monitor) => res,
    };

    let _ = api_sender.send(Health::Bad).await;
    token.cancel();
    close(&registry).await;
    api_task.abort();
    result
}

async fn close(registry: &Registry) {
    if let Err(err) = registry.close().await {
        error!(?err, "error closing registry");
    }
}

/// Mirror the registry lifecycle into the health endpoint. Ends with an
/// error when the coordination session expires.
fn spawn_registry_monitor_task(
    registry: Arc<Registry>,
    health: mpsc::Sender<Health>,
    token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut states = registry.subscribe_state();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("registry monitor task stopping");
                    return Ok(());
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(anyhow!("registry state channel closed"));
                    }
                    let state = *states.borrow_and_update();
                    match state {
                        RegistryState::Active => {
                            info!("coordination restored - reporting healthy");
                            let _ = health.send(Health::Good).await;
                        }
                        RegistryState::Resyncing => {
                            warn!("coordination lost - reporting unhealthy until resynced");
                            let _ = health.send(Health::Bad).await;
                        }
                        RegistryState::Expired => {
                            let _ = health.send(Health::Bad).await;
                            return Err(anyhow!("coordination session expired"));
                        }
                        RegistryState::Closed => {
                            debug!("registry closed");
                            return Ok(());
                        }
                        RegistryState::Opening => {}
                    }
                }
            }
        }
    })
}

async fn flatten<T>(handle: &mut JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
