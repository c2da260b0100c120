//! In-memory chain engine for local development and tests.
//!
//! Implements just enough consensus to exercise the coordination layer:
//! header linkage, proof of work against a fixed target, merkle commitment,
//! coinbase placement and median-time-past. Blocks that extend the best
//! chain are checked and announced on the block-checked bus; blocks that
//! land on a shorter side branch are stored unchecked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::Hash as _;
use tracing::{debug, info};

use crate::coinbase::{self, CoinbaseSpec};
use crate::error::{MiningError, MiningResult};
use crate::gateway::{
    BlockCheckedBus, BlockLookup, BlockStatus, MempoolEntry, MempoolSnapshot, MempoolSource,
    Readiness, SubmitReceipt, TemplateBuilder, TipHandle, ValidationGateway, ValidationState,
};
use crate::longpoll::LongPollCoordinator;
use crate::pow;
use crate::primitives::{
    self, Block, BlockHash, BlockHeader, BlockVersion, CompactTarget, Transaction, TxMerkleNode,
    Txid,
};
use crate::template::{BlockTemplate, BuildError, TemplateParts};

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const BLOCK_VERSION: i32 = 0x2000_0000;
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;
pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;
const COINBASE_RESERVED_WEIGHT: u64 = 4_000;
const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone)]
pub struct DevnetParams {
    pub bits: CompactTarget,
    pub genesis_time: u32,
    pub halving_interval: u32,
    pub chain_name: String,
}

impl Default for DevnetParams {
    fn default() -> Self {
        DevnetParams {
            bits: CompactTarget::from_consensus(REGTEST_BITS),
            genesis_time: 1_296_688_602,
            halving_interval: 150,
            chain_name: "devnet".to_string(),
        }
    }
}

/// 50 coins at height 0, halving every `halving_interval` blocks.
pub fn block_subsidy_sats(height: u32, halving_interval: u32) -> u64 {
    let halvings = height / halving_interval.max(1);
    if halvings >= 64 {
        return 0;
    }
    (50u64 * 100_000_000u64) >> halvings
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct IndexEntry {
    header: BlockHeader,
    height: u32,
    status: BlockStatus,
    has_data: bool,
}

struct ChainState {
    index: HashMap<BlockHash, IndexEntry>,
    /// Active chain, position = height.
    active: Vec<BlockHash>,
    mempool: Vec<MempoolEntry>,
}

impl ChainState {
    fn tip(&self) -> (BlockHash, &IndexEntry) {
        let hash = self.active[self.active.len() - 1];
        (hash, &self.index[&hash])
    }

    fn median_time_past(&self, from: &BlockHash) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(*from);
        while let Some(hash) = cursor {
            let Some(entry) = self.index.get(&hash) else {
                break;
            };
            times.push(entry.header.time);
            if times.len() == MEDIAN_TIME_SPAN || entry.height == 0 {
                break;
            }
            cursor = Some(entry.header.prev_blockhash);
        }
        times.sort_unstable();
        times.get(times.len() / 2).copied().unwrap_or(0)
    }

    /// Makes `new_tip` the active tip, walking back to the fork point.
    fn activate(&mut self, new_tip: BlockHash) {
        let mut branch = Vec::new();
        let mut cursor = new_tip;
        loop {
            let entry = &self.index[&cursor];
            let height = entry.height as usize;
            if self.active.get(height) == Some(&cursor) {
                break;
            }
            branch.push(cursor);
            cursor = entry.header.prev_blockhash;
        }
        let fork_height = self.index[&cursor].height as usize;
        self.active.truncate(fork_height + 1);
        for hash in branch.into_iter().rev() {
            if let Some(entry) = self.index.get_mut(&hash) {
                entry.status = BlockStatus::Valid;
            }
            self.active.push(hash);
        }
    }
}

pub struct DevnetChain {
    params: DevnetParams,
    state: Mutex<ChainState>,
    bus: BlockCheckedBus,
    coordinator: Arc<LongPollCoordinator>,
}

impl DevnetChain {
    pub fn new(params: DevnetParams, coordinator: Arc<LongPollCoordinator>) -> MiningResult<Self> {
        if pow::target_from_bits(params.bits).is_none() {
            return Err(MiningError::InvalidInput(format!(
                "devnet bits {:08x} do not encode a target",
                params.bits.to_consensus()
            )));
        }
        let genesis = Self::genesis_block(&params);
        let hash = genesis.block_hash();

        let mut index = HashMap::new();
        index.insert(
            hash,
            IndexEntry {
                header: genesis.header,
                height: 0,
                status: BlockStatus::Valid,
                has_data: true,
            },
        );

        let chain = DevnetChain {
            params,
            state: Mutex::new(ChainState {
                index,
                active: vec![hash],
                mempool: Vec::new(),
            }),
            bus: BlockCheckedBus::new(),
            coordinator,
        };
        chain.coordinator.tip_updated(hash);
        info!(
            genesis = %hash,
            bits = %format!("{:08x}", chain.params.bits.to_consensus()),
            "devnet chain ready"
        );
        Ok(chain)
    }

    /// Genesis is trusted, so it carries no proof of work.
    fn genesis_block(params: &DevnetParams) -> Block {
        let coinbase = coinbase::build_coinbase(&CoinbaseSpec {
            height: 0,
            extra_nonce: 0,
            value: block_subsidy_sats(0, params.halving_interval),
            payout_script: &[0x51],
            witness_commitment: None,
        });
        let mut block = Block {
            header: BlockHeader {
                version: BlockVersion::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: params.genesis_time,
                bits: params.bits,
                nonce: 0,
            },
            txdata: vec![coinbase],
        };
        block.header.merkle_root = primitives::merkle_root(&block);
        block
    }

    pub fn params(&self) -> &DevnetParams {
        &self.params
    }

    pub fn height(&self) -> u32 {
        self.lock().tip().1.height
    }

    /// Height of `hash` if it is on the active chain.
    pub fn block_height(&self, hash: &BlockHash) -> Option<u32> {
        let state = self.lock();
        let height = state.index.get(hash)?.height;
        (state.active.get(height as usize) == Some(hash)).then_some(height)
    }

    /// Adds a transaction to the mempool. Fees cannot be derived without a
    /// UTXO set, so the caller states them.
    pub fn add_transaction(&self, tx: Transaction, fee: u64) -> MiningResult<Txid> {
        if tx.is_coinbase() {
            return Err(MiningError::InvalidInput("coinbase".to_string()));
        }
        let txid = tx.txid();
        {
            let mut state = self.lock();
            if state.mempool.iter().any(|e| e.tx.txid() == txid) {
                return Err(MiningError::InvalidInput(
                    "txn-already-in-mempool".to_string(),
                ));
            }
            let sigop_cost = 4 * tx.input.len() as u64;
            state.mempool.push(MempoolEntry {
                tx,
                fee,
                sigop_cost,
            });
        }
        let version = self.coordinator.mempool_updated();
        debug!(%txid, fee, mempool_version = version, "transaction added to devnet mempool");
        Ok(txid)
    }

    /// Context checks shared by submission and proposal testing.
    fn check_block(&self, state: &ChainState, block: &Block) -> Result<(), String> {
        if !primitives::starts_with_coinbase(block) {
            return Err("bad-cb-missing".to_string());
        }
        if block.txdata.iter().skip(1).any(Transaction::is_coinbase) {
            return Err("bad-cb-multiple".to_string());
        }
        if !block.check_merkle_root() {
            return Err("bad-txnmrklroot".to_string());
        }
        if block.header.bits != self.params.bits {
            return Err("bad-diffbits".to_string());
        }
        if !pow::check_proof_of_work(block.block_hash(), block.header.bits) {
            return Err("high-hash".to_string());
        }
        let prev = &block.header.prev_blockhash;
        match state.index.get(prev) {
            None => return Err("prev-blk-not-found".to_string()),
            Some(entry) if entry.status == BlockStatus::Failed => {
                return Err("bad-prevblk".to_string());
            }
            Some(_) => {}
        }
        if block.header.time <= state.median_time_past(prev) {
            return Err("time-too-old".to_string());
        }
        if block.weight().to_wu() > MAX_BLOCK_WEIGHT {
            return Err("bad-blk-weight".to_string());
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Connected {
    NewTip { mempool_changed: bool },
    SideBranch,
    Rejected,
}

impl ValidationGateway for DevnetChain {
    fn current_tip(&self) -> MiningResult<TipHandle> {
        let state = self.lock();
        let (hash, entry) = state.tip();
        Ok(TipHandle {
            hash,
            height: entry.height,
            median_time_past: state.median_time_past(&hash),
            bits: entry.header.bits,
        })
    }

    fn lookup_block(&self, hash: &BlockHash) -> MiningResult<BlockLookup> {
        let state = self.lock();
        Ok(match state.index.get(hash) {
            Some(e) if e.has_data || e.status == BlockStatus::Failed => BlockLookup::Known(e.status),
            _ => BlockLookup::Unknown,
        })
    }

    fn knows_header(&self, hash: &BlockHash) -> MiningResult<bool> {
        Ok(self.lock().index.contains_key(hash))
    }

    fn submit_block(&self, block: Arc<Block>) -> MiningResult<SubmitReceipt> {
        let hash = block.block_hash();
        let (verdict, connected) = {
            let mut state = self.lock();
            if let Some(entry) = state.index.get(&hash)
                && entry.has_data
            {
                return Ok(SubmitReceipt {
                    accepted: entry.status != BlockStatus::Failed,
                    new_block: false,
                });
            }

            match self.check_block(&state, &block) {
                Err(reason) => {
                    let prev_height = state
                        .index
                        .get(&block.header.prev_blockhash)
                        .map(|e| e.height);
                    if let Some(prev_height) = prev_height
                        && reason != "bad-txnmrklroot"
                    {
                        let height = prev_height + 1;
                        state.index.insert(
                            hash,
                            IndexEntry {
                                header: block.header,
                                height,
                                status: BlockStatus::Failed,
                                has_data: false,
                            },
                        );
                    }
                    (Some(ValidationState::Invalid { reason }), Connected::Rejected)
                }
                Ok(()) => {
                    let height = state.index[&block.header.prev_blockhash].height + 1;
                    let extends_best = height > state.tip().1.height;
                    state.index.insert(
                        hash,
                        IndexEntry {
                            header: block.header,
                            height,
                            status: BlockStatus::Indeterminate,
                            has_data: true,
                        },
                    );
                    if extends_best {
                        state.activate(hash);
                        let before = state.mempool.len();
                        let mined: Vec<Txid> = block.txdata.iter().map(|t| t.txid()).collect();
                        state.mempool.retain(|e| !mined.contains(&e.tx.txid()));
                        let mempool_changed = state.mempool.len() != before;
                        (
                            Some(ValidationState::Valid),
                            Connected::NewTip { mempool_changed },
                        )
                    } else {
                        (None, Connected::SideBranch)
                    }
                }
            }
        };

        if let Some(state) = &verdict {
            self.bus.publish(&hash, state);
        }

        match connected {
            Connected::NewTip { mempool_changed } => {
                info!(%hash, "devnet connected new tip");
                self.coordinator.tip_updated(hash);
                if mempool_changed {
                    self.coordinator.mempool_updated();
                }
                Ok(SubmitReceipt {
                    accepted: true,
                    new_block: true,
                })
            }
            Connected::SideBranch => {
                debug!(%hash, "devnet stored side-branch block");
                Ok(SubmitReceipt {
                    accepted: true,
                    new_block: true,
                })
            }
            Connected::Rejected => {
                debug!(%hash, ?verdict, "devnet rejected block");
                Ok(SubmitReceipt {
                    accepted: false,
                    new_block: true,
                })
            }
        }
    }

    fn submit_header(&self, header: &BlockHeader) -> MiningResult<ValidationState> {
        let hash = header.block_hash();
        let mut state = self.lock();
        if let Some(entry) = state.index.get(&hash) {
            return Ok(match entry.status {
                BlockStatus::Failed => ValidationState::Invalid {
                    reason: "duplicate-invalid".to_string(),
                },
                _ => ValidationState::Valid,
            });
        }
        let Some(prev) = state.index.get(&header.prev_blockhash) else {
            return Ok(ValidationState::Invalid {
                reason: "prev-blk-not-found".to_string(),
            });
        };
        if prev.status == BlockStatus::Failed {
            return Ok(ValidationState::Invalid {
                reason: "bad-prevblk".to_string(),
            });
        }
        let height = prev.height + 1;
        if header.bits != self.params.bits {
            return Ok(ValidationState::Invalid {
                reason: "bad-diffbits".to_string(),
            });
        }
        if !pow::check_proof_of_work(hash, header.bits) {
            return Ok(ValidationState::Invalid {
                reason: "high-hash".to_string(),
            });
        }
        state.index.insert(
            hash,
            IndexEntry {
                header: *header,
                height,
                status: BlockStatus::Indeterminate,
                has_data: false,
            },
        );
        Ok(ValidationState::Valid)
    }

    fn test_block_validity(&self, block: &Block, tip: &TipHandle) -> MiningResult<ValidationState> {
        let state = self.lock();
        if block.header.prev_blockhash != tip.hash {
            return Ok(ValidationState::Invalid {
                reason: "inconclusive-not-best-prevblk".to_string(),
            });
        }
        Ok(match self.check_block(&state, block) {
            Ok(()) => ValidationState::Valid,
            Err(reason) => ValidationState::Invalid { reason },
        })
    }

    fn readiness(&self) -> MiningResult<Readiness> {
        Ok(Readiness::Ready)
    }

    fn block_checked(&self) -> &BlockCheckedBus {
        &self.bus
    }

    fn chain_name(&self) -> &str {
        &self.params.chain_name
    }
}

impl MempoolSource for DevnetChain {
    fn entries(&self) -> Vec<MempoolEntry> {
        self.lock().mempool.clone()
    }

    fn size(&self) -> usize {
        self.lock().mempool.len()
    }
}

impl TemplateBuilder for DevnetChain {
    fn build(
        &self,
        mempool: &MempoolSnapshot,
        payout_script: &[u8],
    ) -> Result<BlockTemplate, BuildError> {
        let (tip_hash, height, min_time) = {
            let state = self.lock();
            let (hash, entry) = state.tip();
            (hash, entry.height + 1, state.median_time_past(&hash) + 1)
        };

        let mut weight = COINBASE_RESERVED_WEIGHT;
        let mut sigops = 0u64;
        let mut fees = 0u64;
        let mut entries = Vec::new();
        for entry in &mempool.entries {
            let w = entry.tx.weight().to_wu();
            if weight + w > MAX_BLOCK_WEIGHT || sigops + entry.sigop_cost > MAX_BLOCK_SIGOPS_COST {
                continue;
            }
            weight += w;
            sigops += entry.sigop_cost;
            fees += entry.fee;
            entries.push((entry.tx.clone(), entry.fee, entry.sigop_cost));
        }

        BlockTemplate::assemble(TemplateParts {
            version: BlockVersion::from_consensus(BLOCK_VERSION),
            prev_blockhash: tip_hash,
            bits: self.params.bits,
            time: now_secs(),
            min_time,
            height,
            coinbase_value: block_subsidy_sats(height, self.params.halving_interval) + fees,
            payout_script: payout_script.to_vec(),
            witness_commitment: None,
            entries,
            sigop_limit: MAX_BLOCK_SIGOPS_COST,
            size_limit: MAX_BLOCK_WEIGHT,
            rules: vec!["csv".to_string()],
        })
    }
}
