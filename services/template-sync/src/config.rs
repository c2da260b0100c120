use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::Deserialize;
use tracing::warn;

use crate::cache::DEFAULT_MIN_REBUILD_INTERVAL;
use crate::catcher::DEFAULT_NOTIFICATION_TIMEOUT;
use crate::longpoll::{DEFAULT_MEMPOOL_GRACE, DEFAULT_RECHECK_INTERVAL};
use crate::primitives::CompactTarget;
use crate::search::DEFAULT_MAX_TRIES;

pub const DEFAULT_CONFIG_PATH: &str = "config/template-sync.toml";

/// Upper bound for every `*_secs` interval: one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Devnet,
    Bitcoind,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "devnet" => Ok(Backend::Devnet),
            "bitcoind" => Ok(Backend::Bitcoind),
            other => Err(anyhow!("unknown backend {other:?}, expected devnet or bitcoind")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplateSyncConfig {
    /// "devnet" or "bitcoind"
    pub backend: Backend,

    pub http_addr: String,

    /// bitcoind JSON-RPC endpoint when backend == "bitcoind"
    pub rpc_url: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_pass: Option<String>,

    /// bitcoind tip/mempool poll period
    pub poll_interval_secs: u64,

    pub min_rebuild_interval_secs: u64,
    pub longpoll_mempool_grace_secs: u64,
    pub longpoll_recheck_secs: u64,
    pub longpoll_max_wait_secs: u64,
    pub submit_notification_timeout_ms: u64,
    pub default_max_tries: u64,

    /// Hex script paid by templates served over getblocktemplate.
    pub template_payout_script: String,

    /// Compact target of the devnet chain, 8 hex digits.
    pub devnet_bits: String,
}

impl Default for TemplateSyncConfig {
    fn default() -> Self {
        TemplateSyncConfig {
            backend: Backend::Devnet,
            http_addr: "127.0.0.1:8332".to_string(),
            rpc_url: None,
            rpc_user: None,
            rpc_pass: None,
            poll_interval_secs: 1,
            min_rebuild_interval_secs: DEFAULT_MIN_REBUILD_INTERVAL.as_secs(),
            longpoll_mempool_grace_secs: DEFAULT_MEMPOOL_GRACE.as_secs(),
            longpoll_recheck_secs: DEFAULT_RECHECK_INTERVAL.as_secs(),
            longpoll_max_wait_secs: 600,
            submit_notification_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT.as_millis() as u64,
            default_max_tries: DEFAULT_MAX_TRIES,
            template_payout_script: "51".to_string(),
            devnet_bits: "207fffff".to_string(),
        }
    }
}

impl TemplateSyncConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config file failed: {}", path.display()))?;
        let cfg: TemplateSyncConfig = toml::from_str(&contents)
            .with_context(|| format!("config parse failed for {}", path.display()))?;
        Ok(cfg)
    }

    /// Loads `TSYNC_CONFIG` (or the default path), falling back to built-in
    /// defaults when the file is missing, then applies `TSYNC_*` overrides
    /// and validates.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("TSYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = if Path::new(&path).exists() {
            Self::from_path(&path)?
        } else {
            warn!(path = %path, "config file not found, using built-in defaults");
            TemplateSyncConfig::default()
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate().context("config validation failed")?;
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TSYNC_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = lookup("TSYNC_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Some(v) = lookup("TSYNC_RPC_URL") {
            self.rpc_url = Some(v);
        }
        if let Some(v) = lookup("TSYNC_RPC_USER") {
            self.rpc_user = Some(v);
        }
        if let Some(v) = lookup("TSYNC_RPC_PASS") {
            self.rpc_pass = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("poll_interval_secs", self.poll_interval_secs, MAX_INTERVAL_SECS),
            ("longpoll_recheck_secs", self.longpoll_recheck_secs, MAX_INTERVAL_SECS),
            ("longpoll_max_wait_secs", self.longpoll_max_wait_secs, MAX_INTERVAL_SECS),
            (
                "submit_notification_timeout_ms",
                self.submit_notification_timeout_ms,
                MAX_INTERVAL_SECS * 1_000,
            ),
        ];
        for (name, value, max) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
            if value > max {
                bail!("{name} must be at most {max}");
            }
        }
        let may_be_zero = [
            ("min_rebuild_interval_secs", self.min_rebuild_interval_secs),
            ("longpoll_mempool_grace_secs", self.longpoll_mempool_grace_secs),
        ];
        for (name, value) in may_be_zero {
            if value > MAX_INTERVAL_SECS {
                bail!("{name} must be at most {MAX_INTERVAL_SECS}");
            }
        }
        self.payout_script()?;
        self.devnet_bits()?;
        if self.backend == Backend::Bitcoind && self.rpc_url.is_none() {
            bail!("backend bitcoind requires rpc_url");
        }
        Ok(())
    }

    pub fn payout_script(&self) -> anyhow::Result<Vec<u8>> {
        let script = hex::decode(&self.template_payout_script)
            .context("template_payout_script is not valid hex")?;
        if script.is_empty() {
            bail!("template_payout_script must not be empty");
        }
        Ok(script)
    }

    pub fn devnet_bits(&self) -> anyhow::Result<CompactTarget> {
        if self.devnet_bits.len() != 8 {
            bail!("devnet_bits must be 8 hex digits");
        }
        let raw = u32::from_str_radix(&self.devnet_bits, 16).context("devnet_bits is not hex")?;
        let bits = CompactTarget::from_consensus(raw);
        if crate::pow::target_from_bits(bits).is_none() {
            bail!("devnet_bits {raw:08x} does not encode a usable target");
        }
        Ok(bits)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn min_rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.min_rebuild_interval_secs)
    }

    pub fn longpoll_mempool_grace(&self) -> Duration {
        Duration::from_secs(self.longpoll_mempool_grace_secs)
    }

    pub fn longpoll_recheck(&self) -> Duration {
        Duration::from_secs(self.longpoll_recheck_secs)
    }

    pub fn longpoll_max_wait(&self) -> Duration {
        Duration::from_secs(self.longpoll_max_wait_secs)
    }

    pub fn submit_notification_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_notification_timeout_ms)
    }
}
