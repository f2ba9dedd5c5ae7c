use kube::Client;
use tokio::task::JoinHandle;

use crate::{config::RolloutConfig, controller::run_controllers};

/// Spawn the controller set on its own task.
pub fn spawn_controllers(
    client: Client,
    cfg: RolloutConfig,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controllers(client, cfg).await })
}

/// Run every controller until shutdown is signalled.
pub async fn run_all(client: Client, cfg: RolloutConfig) -> anyhow::Result<()> {
    spawn_controllers(client, cfg).await?
}
