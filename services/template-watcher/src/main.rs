use std::env;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use gbt_protocol::{
    BlockTemplateResponse, ErrorBody, MiningInfo, PROTOCOL_VERSION, TemplateReply, TemplateRequest,
};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct WatcherConfig {
    url: String,
    retry_secs: u64,
    /// Must exceed the server's long-poll bound.
    request_timeout_secs: u64,
}

impl WatcherConfig {
    fn from_env() -> Self {
        let url =
            env::var("TSYNC_WATCH_URL").unwrap_or_else(|_| "http://127.0.0.1:8332".to_string());

        let retry_secs = env::var("TSYNC_WATCH_RETRY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let request_timeout_secs = env::var("TSYNC_WATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(700);

        WatcherConfig {
            url,
            retry_secs,
            request_timeout_secs,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/getblocktemplate", self.url.trim_end_matches('/'))
    }

    fn info_endpoint(&self) -> String {
        format!("{}/mininginfo", self.url.trim_end_matches('/'))
    }
}

fn check_protocol(info: &MiningInfo) -> Result<()> {
    if info.protocol_version != PROTOCOL_VERSION {
        bail!(
            "server speaks protocol {}, watcher speaks {PROTOCOL_VERSION}",
            info.protocol_version
        );
    }
    Ok(())
}

async fn fetch_info(client: &reqwest::Client, endpoint: &str) -> Result<MiningInfo> {
    let resp = client.get(endpoint).send().await?.error_for_status()?;
    Ok(resp.json::<MiningInfo>().await?)
}

fn next_request(longpollid: Option<&str>) -> TemplateRequest {
    TemplateRequest {
        longpollid: longpollid.map(str::to_string),
        rules: vec!["segwit".to_string()],
        ..Default::default()
    }
}

/// Whether `next` differs from `prev` in anything a miner would act on.
fn is_new_work(prev: Option<&BlockTemplateResponse>, next: &BlockTemplateResponse) -> bool {
    prev.is_none_or(|p| {
        p.previousblockhash != next.previousblockhash
            || p.transactions != next.transactions
            || p.coinbasevalue != next.coinbasevalue
    })
}

async fn fetch(
    client: &reqwest::Client,
    endpoint: &str,
    req: &TemplateRequest,
) -> Result<BlockTemplateResponse> {
    let resp = client.post(endpoint).json(req).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let detail = match resp.json::<ErrorBody>().await {
            Ok(body) => format!("{:?}: {}", body.category, body.detail),
            Err(_) => "no error body".to_string(),
        };
        return Err(anyhow!("server returned {status}: {detail}"));
    }
    match resp.json::<TemplateReply>().await? {
        TemplateReply::Template(t) => Ok(*t),
        TemplateReply::Status(s) => Err(anyhow!("expected a template, got status {s:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = WatcherConfig::from_env();
    let endpoint = cfg.endpoint();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.request_timeout_secs))
        .build()?;

    info!(endpoint = %endpoint, "template-watcher starting");

    let info_endpoint = cfg.info_endpoint();
    let info = loop {
        match fetch_info(&client, &info_endpoint).await {
            Ok(info) => break info,
            Err(e) => {
                warn!(error = %e, retry_secs = cfg.retry_secs, "mininginfo request failed");
                sleep(Duration::from_secs(cfg.retry_secs)).await;
            }
        }
    };
    check_protocol(&info)?;
    info!(
        chain = %info.chain,
        blocks = info.blocks,
        protocol_version = info.protocol_version,
        "server protocol matches"
    );

    let mut last: Option<BlockTemplateResponse> = None;
    loop {
        let req = next_request(last.as_ref().map(|t| t.longpollid.as_str()));
        match fetch(&client, &endpoint, &req).await {
            Ok(template) => {
                if is_new_work(last.as_ref(), &template) {
                    info!(
                        height = template.height,
                        prev = %template.previousblockhash,
                        txs = template.transactions.len(),
                        coinbase_value = template.coinbasevalue,
                        longpollid = %template.longpollid,
                        "new template"
                    );
                } else {
                    info!(height = template.height, "long poll returned without new work");
                }
                last = Some(template);
            }
            Err(e) => {
                warn!(error = %e, retry_secs = cfg.retry_secs, "template request failed");
                last = None;
                sleep(Duration::from_secs(cfg.retry_secs)).await;
            }
        }
    }
}
