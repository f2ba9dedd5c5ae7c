use envconfig::Envconfig;
use kube::Client;
use oprc_rollout::{config::RolloutConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = RolloutConfig::init_from_env()?;
    info!(?cfg, "Starting rollout operator");

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}
