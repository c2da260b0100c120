//! Mining RPC operations on top of a validation engine.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gbt_protocol::{
    BlockTemplateResponse, MinerStatus, MiningInfo, PROTOCOL_VERSION, SubmitBlockReply,
    TemplateReply, TemplateRequest, TemplateTransaction,
};
use tracing::{debug, info};

use crate::cache::{CachedTemplate, TemplateCache};
use crate::catcher::{SubmissionCatcher, duplicate_outcome, outcome_from_state};
use crate::coinbase::ExtraNonce;
use crate::config::TemplateSyncConfig;
use crate::error::{MiningError, MiningResult};
use crate::gateway::{
    MempoolSnapshot, MempoolSource, Readiness, TemplateBuilder, ValidationGateway,
    ValidationState,
};
use crate::longpoll::{LongPollCoordinator, LongPollToken, WaitOutcome};
use crate::pow;
use crate::primitives::{self, Block, BlockHash, BlockHeader};
use crate::search::ProofSearch;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub min_rebuild_interval: Duration,
    pub longpoll_max_wait: Duration,
    pub notification_timeout: Duration,
    pub default_max_tries: u64,
    /// Payout script of templates served through getblocktemplate.
    pub payout_script: Vec<u8>,
}

impl ServiceSettings {
    pub fn from_config(cfg: &TemplateSyncConfig) -> anyhow::Result<Self> {
        Ok(ServiceSettings {
            min_rebuild_interval: cfg.min_rebuild_interval(),
            longpoll_max_wait: cfg.longpoll_max_wait(),
            notification_timeout: cfg.submit_notification_timeout(),
            default_max_tries: cfg.default_max_tries,
            payout_script: cfg.payout_script()?,
        })
    }
}

/// Engine pieces the service runs against.
#[derive(Clone)]
pub struct Engine {
    pub gateway: Arc<dyn ValidationGateway>,
    pub builder: Arc<dyn TemplateBuilder>,
    pub mempool: Arc<dyn MempoolSource>,
}

pub struct MiningService {
    engine: Engine,
    coordinator: Arc<LongPollCoordinator>,
    cache: TemplateCache,
    /// Shared by every proof search so concurrent or repeated searches at
    /// one tip grind distinct coinbases.
    extra_nonce: Mutex<ExtraNonce>,
    settings: ServiceSettings,
}

enum Mode {
    Template,
    Proposal,
}

fn parse_mode(mode: Option<&str>) -> MiningResult<Mode> {
    match mode {
        None | Some("template") => Ok(Mode::Template),
        Some("proposal") => Ok(Mode::Proposal),
        Some(other) => Err(MiningError::InvalidInput(format!("Invalid mode {other:?}"))),
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub(crate) fn decode_payout_script(hex: &str) -> MiningResult<Vec<u8>> {
    let script =
        primitives::decode_hex_bytes(hex).map_err(|e| MiningError::decode("payout script", e))?;
    if script.is_empty() {
        return Err(MiningError::InvalidInput(
            "payout script must not be empty".to_string(),
        ));
    }
    Ok(script)
}

impl MiningService {
    pub fn new(
        engine: Engine,
        coordinator: Arc<LongPollCoordinator>,
        settings: ServiceSettings,
    ) -> Self {
        MiningService {
            engine,
            coordinator,
            cache: TemplateCache::new(settings.min_rebuild_interval),
            extra_nonce: Mutex::new(ExtraNonce::default()),
            settings,
        }
    }

    pub fn coordinator(&self) -> &Arc<LongPollCoordinator> {
        &self.coordinator
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Releases long polls and stops search loops.
    pub fn shutdown(&self) {
        info!("mining service shutting down");
        self.coordinator.shutdown();
    }

    pub fn get_template(&self, req: &TemplateRequest) -> MiningResult<TemplateReply> {
        match parse_mode(req.mode.as_deref())? {
            Mode::Proposal => {
                let data = req.data.as_deref().ok_or_else(|| {
                    MiningError::InvalidInput("Missing data String key for proposal".to_string())
                })?;
                self.check_proposal(data).map(TemplateReply::Status)
            }
            Mode::Template => {
                let template = self.serve_template(req.longpollid.as_deref())?;
                Ok(TemplateReply::Template(Box::new(template)))
            }
        }
    }

    fn check_proposal(&self, hex: &str) -> MiningResult<Option<String>> {
        let block: Block =
            primitives::from_hex(hex).map_err(|e| MiningError::decode("Block", e))?;
        let hash = block.block_hash();

        if let Some(outcome) = duplicate_outcome(self.engine.gateway.lookup_block(&hash)?) {
            return Ok(outcome.status());
        }

        let tip = self.engine.gateway.current_tip()?;
        if block.header.prev_blockhash != tip.hash {
            return Ok(Some("inconclusive-not-best-prevblk".to_string()));
        }

        match self.engine.gateway.test_block_validity(&block, &tip)? {
            ValidationState::Error { message } => Err(MiningError::Verify(message)),
            state => Ok(outcome_from_state(&state).status()),
        }
    }

    fn serve_template(&self, longpollid: Option<&str>) -> MiningResult<BlockTemplateResponse> {
        match self.engine.gateway.readiness()? {
            Readiness::Ready => {}
            Readiness::NotConnected => {
                return Err(MiningError::Unavailable("engine is not connected".to_string()));
            }
            Readiness::InitialDownload => {
                return Err(MiningError::Unavailable(
                    "engine is in initial sync and waiting for blocks".to_string(),
                ));
            }
        }

        if let Some(id) = longpollid {
            let token: LongPollToken = id.parse()?;
            let outcome = self.coordinator.wait(&token, self.settings.longpoll_max_wait);
            if outcome == WaitOutcome::ShuttingDown {
                return Err(MiningError::Unavailable("Shutting down".to_string()));
            }
        } else if self.coordinator.is_shutting_down() {
            return Err(MiningError::Unavailable("Shutting down".to_string()));
        }

        let cached = self.current_template(&self.settings.payout_script)?;
        render_template(&cached, now_secs())
    }

    fn current_template(&self, payout_script: &[u8]) -> MiningResult<CachedTemplate> {
        let snapshot = MempoolSnapshot {
            update_counter: self.coordinator.mempool_version(),
            entries: self.engine.mempool.entries(),
        };
        let tip = self.engine.gateway.current_tip()?;
        self.cache
            .get(self.engine.builder.as_ref(), &snapshot, &tip, payout_script)
    }

    pub fn submit_block(&self, hexdata: &str) -> MiningResult<SubmitBlockReply> {
        let block: Block =
            primitives::from_hex(hexdata).map_err(|e| MiningError::decode("Block", e))?;
        let outcome = SubmissionCatcher::new(
            self.engine.gateway.as_ref(),
            self.settings.notification_timeout,
        )
        .submit(block)?;
        Ok(SubmitBlockReply {
            status: outcome.status(),
        })
    }

    pub fn submit_header(&self, hexdata: &str) -> MiningResult<()> {
        let header: BlockHeader =
            primitives::from_hex(hexdata).map_err(|e| MiningError::decode("Header", e))?;

        if !self.engine.gateway.knows_header(&header.prev_blockhash)? {
            return Err(MiningError::ValidationRejected(format!(
                "Must submit previous header ({}) first",
                header.prev_blockhash
            )));
        }

        match self.engine.gateway.submit_header(&header)? {
            ValidationState::Valid => {
                debug!(hash = %header.block_hash(), "header accepted");
                Ok(())
            }
            ValidationState::Invalid { reason } => Err(MiningError::ValidationRejected(reason)),
            ValidationState::Error { message } => Err(MiningError::Verify(message)),
        }
    }

    /// Mines `count` blocks to `payout_script_hex`. `max_tries` defaults to
    /// the configured per-block budget.
    pub fn search_for_blocks(
        &self,
        payout_script_hex: &str,
        count: u32,
        max_tries: Option<u64>,
        stop: &AtomicBool,
    ) -> MiningResult<Vec<BlockHash>> {
        let script = decode_payout_script(payout_script_hex)?;
        self.search_with_script(&script, count, max_tries, stop)
    }

    pub(crate) fn search_with_script(
        &self,
        script: &[u8],
        count: u32,
        max_tries: Option<u64>,
        stop: &AtomicBool,
    ) -> MiningResult<Vec<BlockHash>> {
        ProofSearch::new(
            self.engine.gateway.as_ref(),
            self.engine.builder.as_ref(),
            self.engine.mempool.as_ref(),
            &self.coordinator,
            &self.extra_nonce,
        )
        .run(
            script,
            count,
            max_tries.unwrap_or(self.settings.default_max_tries),
            stop,
        )
    }

    pub fn mining_info(&self, miner: MinerStatus) -> MiningResult<MiningInfo> {
        let tip = self.engine.gateway.current_tip()?;
        let difficulty = pow::target_from_bits(tip.bits)
            .map(|t| t.difficulty_float())
            .ok_or_else(|| {
                MiningError::Internal(format!(
                    "tip {} carries invalid bits {:08x}",
                    tip.hash,
                    tip.bits.to_consensus()
                ))
            })?;
        let current = self.cache.current();
        Ok(MiningInfo {
            blocks: tip.height,
            bestblockhash: tip.hash.to_string(),
            currentblockweight: current.as_ref().map(|t| t.weight()),
            currentblocktx: current.as_ref().map(|t| t.transactions.len() as u64),
            pooledtx: self.engine.mempool.size() as u64,
            mempool_version: self.coordinator.mempool_version(),
            chain: self.engine.gateway.chain_name().to_string(),
            difficulty,
            protocol_version: PROTOCOL_VERSION,
            miner,
        })
    }
}

/// Wire form of a cached template. `curtime` is stamped per response; the
/// cached template is left untouched.
pub fn render_template(cached: &CachedTemplate, now: u32) -> MiningResult<BlockTemplateResponse> {
    let t = &cached.template;
    let token = LongPollToken {
        tip: t.previous_block_hash(),
        mempool_version: cached.mempool_version,
    };
    let bits = t.bits().to_consensus();
    let target = pow::target_from_bits(t.bits()).ok_or_else(|| {
        MiningError::Internal(format!("template carries invalid bits {bits:08x}"))
    })?;

    Ok(BlockTemplateResponse {
        capabilities: vec!["proposal".to_string()],
        version: t.header.version.to_consensus(),
        rules: t.rules.clone(),
        previousblockhash: t.previous_block_hash().to_string(),
        transactions: t
            .transactions
            .iter()
            .map(|entry| TemplateTransaction {
                data: primitives::to_hex(&entry.tx),
                txid: entry.tx.txid().to_string(),
                hash: entry.tx.wtxid().to_string(),
                depends: entry.depends.iter().map(|&d| d as u64).collect(),
                fee: entry.fee,
                sigops: entry.sigop_cost,
                weight: entry.weight,
            })
            .collect(),
        coinbaseaux: serde_json::Map::new(),
        coinbasevalue: t.coinbase_value,
        longpollid: token.to_string(),
        target: pow::target_hex(&target),
        mintime: t.min_time,
        mutable: vec![
            "time".to_string(),
            "transactions".to_string(),
            "prevblock".to_string(),
        ],
        noncerange: "00000000ffffffff".to_string(),
        sigoplimit: t.sigop_limit,
        sizelimit: t.size_limit,
        curtime: now.max(t.min_time),
        bits: format!("{bits:08x}"),
        height: t.height,
    })
}
