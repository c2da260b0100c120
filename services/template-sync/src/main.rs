use std::sync::Arc;

use anyhow::Context;
use bitcoin::hashes::Hash as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use template_sync::api::{self, AppState};
use template_sync::bitcoind::{self, BitcoindEngine};
use template_sync::config::{Backend, TemplateSyncConfig};
use template_sync::devnet::{DevnetChain, DevnetParams};
use template_sync::gateway::ValidationGateway;
use template_sync::longpoll::LongPollCoordinator;
use template_sync::miner::BackgroundMiner;
use template_sync::primitives::BlockHash;
use template_sync::{Engine, MiningService, ServiceSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = TemplateSyncConfig::load()?;
    info!(backend = ?cfg.backend, http_addr = %cfg.http_addr, "template-sync starting");

    let coordinator = Arc::new(LongPollCoordinator::new(
        BlockHash::all_zeros(),
        cfg.longpoll_mempool_grace(),
        cfg.longpoll_recheck(),
    ));

    let (engine, devnet) = match cfg.backend {
        Backend::Devnet => {
            let params = DevnetParams {
                bits: cfg.devnet_bits()?,
                ..DevnetParams::default()
            };
            let chain = Arc::new(
                DevnetChain::new(params, coordinator.clone()).context("devnet startup failed")?,
            );
            let engine = Engine {
                gateway: chain.clone(),
                builder: chain.clone(),
                mempool: chain.clone(),
            };
            (engine, Some(chain))
        }
        Backend::Bitcoind => {
            let url = cfg
                .rpc_url
                .clone()
                .context("backend bitcoind requires rpc_url")?;
            let user = cfg.rpc_user.clone();
            let pass = cfg.rpc_pass.clone();
            let (node, tip) = tokio::task::spawn_blocking(move || {
                let node = BitcoindEngine::connect(&url, user.as_deref(), pass.as_deref())?;
                let tip = node.current_tip()?;
                Ok::<_, template_sync::MiningError>((node, tip))
            })
            .await?
            .context("bitcoind connection failed")?;
            coordinator.tip_updated(tip.hash);

            let node = Arc::new(node);
            bitcoind::spawn_poller(node.clone(), coordinator.clone(), cfg.poll_interval())
                .context("spawn bitcoind poller")?;
            let engine = Engine {
                gateway: node.clone(),
                builder: node.clone(),
                mempool: node,
            };
            (engine, None)
        }
    };

    let settings = ServiceSettings::from_config(&cfg)?;
    let service = Arc::new(MiningService::new(engine, coordinator, settings));
    let miner = Arc::new(BackgroundMiner::new(service.clone()));

    let state = AppState {
        service: service.clone(),
        miner: miner.clone(),
        devnet,
    };

    let shutdown = {
        let service = service.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
            }
            service.shutdown();
        }
    };

    api::run_http_server(&cfg.http_addr, state, shutdown).await?;

    tokio::task::spawn_blocking(move || miner.stop()).await?;
    info!("template-sync stopped");
    Ok(())
}
