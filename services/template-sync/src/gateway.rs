//! Interfaces to the chain-validation engine and the template builder, plus
//! the block-checked notification bus the engine publishes on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::MiningError;
use crate::primitives::{Block, BlockHash, BlockHeader, CompactTarget, Transaction};
use crate::template::{BlockTemplate, BuildError};

/// Identity of the active chain tip at the time it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipHandle {
    pub hash: BlockHash,
    pub height: u32,
    pub median_time_past: u32,
    pub bits: CompactTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Fully validated.
    Valid,
    /// Previously marked invalid.
    Failed,
    /// Stored but never checked, e.g. a side-chain block.
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLookup {
    Unknown,
    Known(BlockStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    Valid,
    Invalid { reason: String },
    Error { message: String },
}

/// Immediate answer of the engine to a block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub accepted: bool,
    /// False when the engine had already processed this block.
    pub new_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotConnected,
    InitialDownload,
}

pub trait ValidationGateway: Send + Sync {
    fn current_tip(&self) -> Result<TipHandle, MiningError>;

    fn lookup_block(&self, hash: &BlockHash) -> Result<BlockLookup, MiningError>;

    fn knows_header(&self, hash: &BlockHash) -> Result<bool, MiningError>;

    /// Hands a block to validation. Any block-checked notification is
    /// published on [`ValidationGateway::block_checked`].
    fn submit_block(&self, block: Arc<Block>) -> Result<SubmitReceipt, MiningError>;

    fn submit_header(&self, header: &BlockHeader) -> Result<ValidationState, MiningError>;

    /// Checks `block` against `tip` without storing it.
    fn test_block_validity(
        &self,
        block: &Block,
        tip: &TipHandle,
    ) -> Result<ValidationState, MiningError>;

    fn readiness(&self) -> Result<Readiness, MiningError>;

    fn block_checked(&self) -> &BlockCheckedBus;

    fn chain_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub fee: u64,
    pub sigop_cost: u64,
}

/// Mempool contents plus the update counter they were read under.
#[derive(Debug, Clone, Default)]
pub struct MempoolSnapshot {
    pub update_counter: u64,
    pub entries: Vec<MempoolEntry>,
}

pub trait MempoolSource: Send + Sync {
    fn entries(&self) -> Vec<MempoolEntry>;

    fn size(&self) -> usize;
}

pub trait TemplateBuilder: Send + Sync {
    fn build(
        &self,
        mempool: &MempoolSnapshot,
        payout_script: &[u8],
    ) -> Result<BlockTemplate, BuildError>;
}

type CheckedHandler = Arc<dyn Fn(&BlockHash, &ValidationState) + Send + Sync>;

/// Fan-out of "block checked" events to registered handlers.
#[derive(Default)]
pub struct BlockCheckedBus {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, CheckedHandler>>,
}

impl BlockCheckedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`; it stays registered until the returned guard drops.
    pub fn subscribe<F>(&self, handler: F) -> Subscription<'_>
    where
        F: Fn(&BlockHash, &ValidationState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Arc::new(handler));
        Subscription { bus: self, id }
    }

    pub fn publish(&self, hash: &BlockHash, state: &ValidationState) {
        // handlers run outside the lock so they may subscribe or unsubscribe
        let handlers: Vec<CheckedHandler> = self.lock().values().cloned().collect();
        for handler in handlers {
            handler(hash, state);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, CheckedHandler>> {
        match self.handlers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Registration guard returned by [`BlockCheckedBus::subscribe`].
pub struct Subscription<'a> {
    bus: &'a BlockCheckedBus,
    id: u64,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = BlockCheckedBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&BlockHash::all_zeros(), &ValidationState::Valid);
        drop(sub);
        bus.publish(&BlockHash::all_zeros(), &ValidationState::Valid);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
