use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use discovery_core::{
    Registry, RegistryState,
    tokio::{self, task::JoinHandle},
};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    monitor_task: &mut JoinHandle<Result<(), anyhow::Error>>,
    registry: &Registry,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    verify_monitor_task_running("registry monitor", monitor_task)
        .await
        .context("startup check failed")?;
    verify_registry_active(registry).context("startup check failed")?;
    Ok(())
}

pub async fn verify_monitor_task_running(
    name: &str,
    task: &mut JoinHandle<Result<(), anyhow::Error>>,
) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(Ok(())) => Err(anyhow!("{name} exited during startup stabilization window")),
            Ok(Err(err)) => Err(anyhow!("{name} failed during startup: {err}")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

pub fn verify_registry_active(registry: &Registry) -> Result<()> {
    match registry.state() {
        RegistryState::Active => Ok(()),
        state => bail!("registry is {state} after startup, expected active"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use discovery_core::{RegistryOptions, coordination::MemoryTree};

    use super::*;

    #[tokio::test]
    async fn test_running_tasks_pass() {
        let mut bg = tokio::spawn(std::future::pending::<()>());
        let mut monitor = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(verify_background_task_running("bg", &mut bg).await.is_ok());
        assert!(verify_monitor_task_running("monitor", &mut monitor).await.is_ok());
        bg.abort();
        monitor.abort();
    }

    #[tokio::test]
    async fn test_exited_tasks_fail() {
        let mut bg = tokio::spawn(async {});
        let err = verify_background_task_running("bg", &mut bg).await.unwrap_err();
        assert!(err.to_string().contains("exited during startup"));

        let mut monitor = tokio::spawn(async { Err(anyhow!("boom")) });
        let err = verify_monitor_task_running("monitor", &mut monitor)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_registry_state_checked() -> Result<()> {
        let tree = MemoryTree::new();
        let registry = Registry::open(
            Arc::new(tree.open_session()?),
            RegistryOptions {
                host: "a:1".into(),
                load_ceiling: 10,
            },
        )
        .await?;
        verify_registry_active(&registry)?;

        registry.close().await?;
        let err = verify_registry_active(&registry).unwrap_err();
        assert!(err.to_string().contains("closed"));
        Ok(())
    }
}
