//! Engine adapter for a bitcoind node reached over JSON-RPC.
//!
//! bitcoind does not expose its block-checked callback, so the adapter
//! publishes one itself from the submitblock result. Tip and mempool
//! changes are discovered by a polling thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitcoincore_rpc::jsonrpc::error::Error as JsonRpcError;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{MiningError, MiningResult};
use crate::gateway::{
    BlockCheckedBus, BlockLookup, BlockStatus, MempoolEntry, MempoolSnapshot, MempoolSource,
    Readiness, SubmitReceipt, TemplateBuilder, TipHandle, ValidationGateway, ValidationState,
};
use crate::longpoll::LongPollCoordinator;
use crate::primitives::{
    self, Block, BlockHash, BlockHeader, BlockVersion, CompactTarget, Transaction,
};
use crate::template::{BlockTemplate, BuildError, TemplateParts};

/// RPC_INVALID_ADDRESS_OR_KEY, returned for unknown block hashes.
const RPC_NOT_FOUND: i32 = -5;
/// RPC_VERIFY_ERROR
const RPC_VERIFY_ERROR: i32 = -25;

pub struct BitcoindEngine {
    rpc: Client,
    bus: BlockCheckedBus,
    chain: String,
}

enum RpcFailure {
    Code(i32, String),
    Transport(String),
}

impl BitcoindEngine {
    pub fn connect(url: &str, user: Option<&str>, pass: Option<&str>) -> MiningResult<Self> {
        let auth = match (user, pass) {
            (Some(u), Some(p)) => Auth::UserPass(u.to_string(), p.to_string()),
            _ => Auth::None,
        };
        let rpc = Client::new(url, auth)
            .map_err(|e| MiningError::Unavailable(format!("bitcoind client: {e}")))?;

        let info: Value = rpc
            .call("getblockchaininfo", &[])
            .map_err(|e| MiningError::Unavailable(format!("getblockchaininfo: {e}")))?;
        let chain = info["chain"].as_str().unwrap_or("unknown").to_string();
        info!(url, chain = %chain, blocks = ?info["blocks"].as_u64(), "connected to bitcoind");

        Ok(BitcoindEngine {
            rpc,
            bus: BlockCheckedBus::new(),
            chain,
        })
    }

    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcFailure> {
        self.rpc.call::<Value>(method, params).map_err(|e| match e {
            bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Rpc(rpc)) => {
                RpcFailure::Code(rpc.code, rpc.message)
            }
            other => RpcFailure::Transport(other.to_string()),
        })
    }

    fn call_checked(&self, method: &str, params: &[Value]) -> MiningResult<Value> {
        self.call(method, params).map_err(|f| match f {
            RpcFailure::Code(code, message) => {
                MiningError::Unavailable(format!("{method} failed ({code}): {message}"))
            }
            RpcFailure::Transport(message) => {
                MiningError::Unavailable(format!("{method}: {message}"))
            }
        })
    }

    fn header(&self, hash: &BlockHash) -> MiningResult<Option<Value>> {
        match self.call("getblockheader", &[json!(hash.to_string())]) {
            Ok(v) => Ok(Some(v)),
            Err(RpcFailure::Code(RPC_NOT_FOUND, _)) => Ok(None),
            Err(RpcFailure::Code(code, message)) => Err(MiningError::Unavailable(format!(
                "getblockheader failed ({code}): {message}"
            ))),
            Err(RpcFailure::Transport(message)) => {
                Err(MiningError::Unavailable(format!("getblockheader: {message}")))
            }
        }
    }

    /// Tip hash and mempool fingerprint, as observed by the poller.
    fn observe(&self) -> MiningResult<(BlockHash, (u64, u64))> {
        let tip = self.best_block_hash()?;
        let mempool = self.call_checked("getmempoolinfo", &[])?;
        let fingerprint = (
            mempool["size"].as_u64().unwrap_or(0),
            mempool["bytes"].as_u64().unwrap_or(0),
        );
        Ok((tip, fingerprint))
    }

    fn best_block_hash(&self) -> MiningResult<BlockHash> {
        let best = self.call_checked("getbestblockhash", &[])?;
        best.as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MiningError::Internal("getbestblockhash returned no hash".into()))
    }
}

/// Tip handle from a getblockheader reply for `hash`.
fn tip_from_header(hash: BlockHash, header: &Value) -> MiningResult<TipHandle> {
    let bad = |what: &str| MiningError::Internal(format!("getblockheader {hash}: bad {what}"));
    let bits = header["bits"]
        .as_str()
        .and_then(|b| u32::from_str_radix(b, 16).ok())
        .ok_or_else(|| bad("bits"))?;
    Ok(TipHandle {
        hash,
        height: header["height"].as_u64().ok_or_else(|| bad("height"))? as u32,
        median_time_past: header["mediantime"].as_u64().unwrap_or(0) as u32,
        bits: CompactTarget::from_consensus(bits),
    })
}

/// Translates a submitblock result into a receipt and the block-checked
/// event to synthesize, if any.
fn receipt_for(result: Option<&str>) -> (SubmitReceipt, Option<ValidationState>) {
    match result {
        None => (
            SubmitReceipt {
                accepted: true,
                new_block: true,
            },
            Some(ValidationState::Valid),
        ),
        Some("duplicate") => (
            SubmitReceipt {
                accepted: true,
                new_block: false,
            },
            None,
        ),
        Some("inconclusive") | Some("duplicate-inconclusive") => (
            SubmitReceipt {
                accepted: true,
                new_block: true,
            },
            None,
        ),
        Some(reason) => (
            SubmitReceipt {
                accepted: false,
                new_block: true,
            },
            Some(ValidationState::Invalid {
                reason: reason.to_string(),
            }),
        ),
    }
}

/// Status of a block that is not on the active chain, judged from
/// getchaintips.
fn status_from_tips(tips: &Value, hash: &BlockHash) -> BlockLookup {
    let hex = hash.to_string();
    let tip = tips
        .as_array()
        .and_then(|all| all.iter().find(|t| t["hash"].as_str() == Some(hex.as_str())));
    match tip.and_then(|t| t["status"].as_str()) {
        Some("invalid") => BlockLookup::Known(BlockStatus::Failed),
        Some("headers-only") | Some("valid-headers") => BlockLookup::Unknown,
        Some("valid-fork") => BlockLookup::Known(BlockStatus::Valid),
        _ => BlockLookup::Known(BlockStatus::Indeterminate),
    }
}

fn hex_field<'a>(gbt: &'a Value, key: &str) -> Result<&'a str, BuildError> {
    gbt[key]
        .as_str()
        .ok_or_else(|| BuildError::Backend(format!("getblocktemplate missing {key}")))
}

fn u64_field(gbt: &Value, key: &str) -> Result<u64, BuildError> {
    gbt[key]
        .as_u64()
        .ok_or_else(|| BuildError::Backend(format!("getblocktemplate missing {key}")))
}

/// Converts a getblocktemplate reply into template parts paying to
/// `payout_script`. The node's own transaction selection is kept as is.
fn parts_from_gbt(gbt: &Value, payout_script: &[u8]) -> Result<TemplateParts, BuildError> {
    let bad = |what: &str, e: &dyn std::fmt::Display| BuildError::Backend(format!("{what}: {e}"));

    let prev_blockhash = hex_field(gbt, "previousblockhash")?
        .parse::<BlockHash>()
        .map_err(|e| bad("previousblockhash", &e))?;
    let bits = u32::from_str_radix(hex_field(gbt, "bits")?, 16)
        .map(CompactTarget::from_consensus)
        .map_err(|e| bad("bits", &e))?;

    let mut entries = Vec::new();
    if let Some(txs) = gbt["transactions"].as_array() {
        for tx in txs {
            let data = hex_field(tx, "data")?;
            let parsed: Transaction =
                primitives::from_hex(data).map_err(|e| bad("transaction", &e))?;
            entries.push((
                parsed,
                tx["fee"].as_u64().unwrap_or(0),
                tx["sigops"].as_u64().unwrap_or(0),
            ));
        }
    }

    let witness_commitment = match gbt["default_witness_commitment"].as_str() {
        Some(h) => Some(hex::decode(h).map_err(|e| bad("default_witness_commitment", &e))?),
        None => None,
    };

    let rules = gbt["rules"]
        .as_array()
        .map(|r| {
            r.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(TemplateParts {
        version: BlockVersion::from_consensus(gbt["version"].as_i64().unwrap_or(0x2000_0000) as i32),
        prev_blockhash,
        bits,
        time: u64_field(gbt, "curtime")? as u32,
        min_time: u64_field(gbt, "mintime")? as u32,
        height: u64_field(gbt, "height")? as u32,
        coinbase_value: u64_field(gbt, "coinbasevalue")?,
        payout_script: payout_script.to_vec(),
        witness_commitment,
        entries,
        sigop_limit: gbt["sigoplimit"].as_u64().unwrap_or(80_000),
        size_limit: gbt["weightlimit"].as_u64().unwrap_or(4_000_000),
        rules,
    })
}

impl ValidationGateway for BitcoindEngine {
    fn current_tip(&self) -> MiningResult<TipHandle> {
        let hash = self.best_block_hash()?;
        let header = self
            .header(&hash)?
            .ok_or_else(|| MiningError::Unavailable(format!("best block {hash} vanished")))?;
        tip_from_header(hash, &header)
    }

    fn lookup_block(&self, hash: &BlockHash) -> MiningResult<BlockLookup> {
        let Some(header) = self.header(hash)? else {
            return Ok(BlockLookup::Unknown);
        };
        if header["confirmations"].as_i64().unwrap_or(-1) >= 0 {
            return Ok(BlockLookup::Known(BlockStatus::Valid));
        }
        let tips = self.call_checked("getchaintips", &[])?;
        Ok(status_from_tips(&tips, hash))
    }

    fn knows_header(&self, hash: &BlockHash) -> MiningResult<bool> {
        Ok(self.header(hash)?.is_some())
    }

    fn submit_block(&self, block: Arc<Block>) -> MiningResult<SubmitReceipt> {
        let hash = block.block_hash();
        let result = self.call_checked("submitblock", &[json!(primitives::to_hex(&*block))])?;
        let (receipt, event) = receipt_for(result.as_str());
        debug!(%hash, result = %result, "submitblock");
        if let Some(state) = event {
            self.bus.publish(&hash, &state);
        }
        Ok(receipt)
    }

    fn submit_header(&self, header: &BlockHeader) -> MiningResult<ValidationState> {
        match self.call("submitheader", &[json!(primitives::to_hex(header))]) {
            Ok(_) => Ok(ValidationState::Valid),
            Err(RpcFailure::Code(RPC_VERIFY_ERROR, reason)) => {
                Ok(ValidationState::Invalid { reason })
            }
            Err(RpcFailure::Code(code, message)) => Ok(ValidationState::Error {
                message: format!("{message} ({code})"),
            }),
            Err(RpcFailure::Transport(message)) => {
                Err(MiningError::Unavailable(format!("submitheader: {message}")))
            }
        }
    }

    fn test_block_validity(&self, block: &Block, _tip: &TipHandle) -> MiningResult<ValidationState> {
        let req = json!({
            "mode": "proposal",
            "data": primitives::to_hex(block),
            "rules": ["segwit"],
        });
        match self.call("getblocktemplate", &[req]) {
            Ok(Value::Null) => Ok(ValidationState::Valid),
            Ok(Value::String(reason)) => Ok(ValidationState::Invalid { reason }),
            Ok(other) => Ok(ValidationState::Error {
                message: format!("unexpected proposal reply {other}"),
            }),
            Err(RpcFailure::Code(code, message)) => Ok(ValidationState::Error {
                message: format!("{message} ({code})"),
            }),
            Err(RpcFailure::Transport(message)) => {
                Err(MiningError::Unavailable(format!("getblocktemplate: {message}")))
            }
        }
    }

    fn readiness(&self) -> MiningResult<Readiness> {
        if self.chain != "regtest" {
            let peers = self.call_checked("getconnectioncount", &[])?;
            if peers.as_u64().unwrap_or(0) == 0 {
                return Ok(Readiness::NotConnected);
            }
        }
        let info = self.call_checked("getblockchaininfo", &[])?;
        if info["initialblockdownload"].as_bool().unwrap_or(false) {
            return Ok(Readiness::InitialDownload);
        }
        Ok(Readiness::Ready)
    }

    fn block_checked(&self) -> &BlockCheckedBus {
        &self.bus
    }

    fn chain_name(&self) -> &str {
        &self.chain
    }
}

impl MempoolSource for BitcoindEngine {
    /// The node selects transactions itself; nothing is handed to the builder.
    fn entries(&self) -> Vec<MempoolEntry> {
        Vec::new()
    }

    fn size(&self) -> usize {
        match self.call_checked("getmempoolinfo", &[]) {
            Ok(info) => info["size"].as_u64().unwrap_or(0) as usize,
            Err(e) => {
                warn!(error = %e, "getmempoolinfo failed");
                0
            }
        }
    }
}

impl TemplateBuilder for BitcoindEngine {
    fn build(
        &self,
        _mempool: &MempoolSnapshot,
        payout_script: &[u8],
    ) -> Result<BlockTemplate, BuildError> {
        let gbt = self
            .call_checked("getblocktemplate", &[json!({ "rules": ["segwit"] })])
            .map_err(|e| BuildError::Backend(e.to_string()))?;
        BlockTemplate::assemble(parts_from_gbt(&gbt, payout_script)?)
    }
}

/// Polls the node and forwards tip and mempool changes to `coordinator`
/// until it shuts down.
pub fn spawn_poller(
    engine: Arc<BitcoindEngine>,
    coordinator: Arc<LongPollCoordinator>,
    interval: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bitcoind-poller".to_string())
        .spawn(move || {
            let mut last_mempool = None;
            while !coordinator.is_shutting_down() {
                match engine.observe() {
                    Ok((tip, mempool)) => {
                        coordinator.tip_updated(tip);
                        if last_mempool.is_some_and(|m| m != mempool) {
                            coordinator.mempool_updated();
                        }
                        last_mempool = Some(mempool);
                    }
                    Err(e) => warn!(error = %e, "bitcoind poll failed"),
                }
                thread::sleep(interval);
            }
            debug!("bitcoind poller exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;

    fn gbt() -> Value {
        json!({
            "version": 536870912,
            "rules": ["csv", "!segwit", "taproot"],
            "previousblockhash": "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            "transactions": [],
            "coinbasevalue": 5000000000u64,
            "target": "7fffff0000000000000000000000000000000000000000000000000000000000",
            "mintime": 1296688603,
            "curtime": 1700000000,
            "bits": "207fffff",
            "height": 1,
            "sigoplimit": 80000,
            "weightlimit": 4000000,
            "default_witness_commitment": "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9"
        })
    }

    #[test]
    fn parses_getblocktemplate_reply() {
        let parts = parts_from_gbt(&gbt(), &[0x51]).unwrap();
        assert_eq!(parts.height, 1);
        assert_eq!(parts.bits.to_consensus(), 0x207f_ffff);
        assert_eq!(parts.version.to_consensus(), 0x2000_0000);
        assert_eq!(parts.coinbase_value, 50_0000_0000);
        assert_eq!(parts.rules, vec!["csv", "!segwit", "taproot"]);
        assert_eq!(parts.witness_commitment.as_ref().map(Vec::len), Some(38));
        assert_eq!(
            parts.prev_blockhash.to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );

        let template = BlockTemplate::assemble(parts).unwrap();
        assert!(template.coinbase.is_coinbase());
        assert_eq!(template.header.time, 1_700_000_000);
        assert_eq!(template.coinbase.output.len(), 2);
    }

    #[test]
    fn missing_fields_are_backend_errors() {
        let mut reply = gbt();
        reply.as_object_mut().unwrap().remove("height");
        assert!(matches!(
            parts_from_gbt(&reply, &[0x51]),
            Err(BuildError::Backend(_))
        ));
    }

    #[test]
    fn submitblock_results_map_to_receipts() {
        let (r, ev) = receipt_for(None);
        assert!(r.accepted && r.new_block);
        assert_eq!(ev, Some(ValidationState::Valid));

        let (r, ev) = receipt_for(Some("duplicate"));
        assert!(r.accepted && !r.new_block);
        assert!(ev.is_none());

        let (r, ev) = receipt_for(Some("inconclusive"));
        assert!(r.accepted);
        assert!(ev.is_none());

        let (r, ev) = receipt_for(Some("high-hash"));
        assert!(!r.accepted);
        assert_eq!(
            ev,
            Some(ValidationState::Invalid {
                reason: "high-hash".into()
            })
        );
    }

    #[test]
    fn tip_comes_from_best_header() {
        let hash = BlockHash::hash(b"best");
        let header = json!({
            "hash": hash.to_string(),
            "height": 120,
            "mediantime": 1_700_000_000u64,
            "bits": "1d00ffff",
        });
        let tip = tip_from_header(hash, &header).unwrap();
        assert_eq!(tip.height, 120);
        assert_eq!(tip.median_time_past, 1_700_000_000);
        assert_eq!(tip.bits.to_consensus(), 0x1d00_ffff);

        let no_bits = json!({ "height": 120 });
        assert!(matches!(
            tip_from_header(hash, &no_bits),
            Err(MiningError::Internal(_))
        ));
    }

    #[test]
    fn chain_tip_status_maps_to_lookup() {
        let hash = BlockHash::hash(b"fork");
        let tips = json!([
            { "hash": hash.to_string(), "height": 5, "branchlen": 1, "status": "invalid" },
            { "hash": BlockHash::all_zeros().to_string(), "height": 6, "branchlen": 0, "status": "active" }
        ]);
        assert_eq!(
            status_from_tips(&tips, &hash),
            BlockLookup::Known(BlockStatus::Failed)
        );
        assert_eq!(
            status_from_tips(&tips, &BlockHash::hash(b"other")),
            BlockLookup::Known(BlockStatus::Indeterminate)
        );
    }
}
