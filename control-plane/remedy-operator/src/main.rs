use std::sync::Arc;

use envconfig::Envconfig;
use kube::Client;
use remedy_operator::cluster::kube::KubeObserver;
use remedy_operator::config::RemedyConfig;
use remedy_operator::{init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = RemedyConfig::init_from_env()?.normalized();
    info!(?cfg, "Starting remedy-operator");

    let client = Client::try_default().await?;
    let observer = Arc::new(KubeObserver::new(client));
    runtime::run_all(observer, cfg).await
}
