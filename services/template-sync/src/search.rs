//! Bounded proof-of-work search that mines blocks on top of the active tip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash as _;
use tracing::{debug, info, warn};

use crate::coinbase::ExtraNonce;
use crate::error::{MiningError, MiningResult};
use crate::gateway::{MempoolSnapshot, MempoolSource, TemplateBuilder, ValidationGateway};
use crate::longpoll::LongPollCoordinator;
use crate::pow;
use crate::primitives::{Block, BlockHash, Target};

pub const DEFAULT_MAX_TRIES: u64 = 1_000_000;

enum Attempt {
    Found,
    NonceExhausted,
    BudgetExhausted,
    Stopped,
}

pub struct ProofSearch<'a> {
    gateway: &'a dyn ValidationGateway,
    builder: &'a dyn TemplateBuilder,
    mempool: &'a dyn MempoolSource,
    coordinator: &'a LongPollCoordinator,
    /// Shared by every search of the service so that two searches at the
    /// same tip never grind an identical coinbase.
    extra_nonce: &'a Mutex<ExtraNonce>,
    start_nonce: u32,
}

impl<'a> ProofSearch<'a> {
    pub fn new(
        gateway: &'a dyn ValidationGateway,
        builder: &'a dyn TemplateBuilder,
        mempool: &'a dyn MempoolSource,
        coordinator: &'a LongPollCoordinator,
        extra_nonce: &'a Mutex<ExtraNonce>,
    ) -> Self {
        ProofSearch {
            gateway,
            builder,
            mempool,
            coordinator,
            extra_nonce,
            start_nonce: 0,
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, nonce: u32) -> Self {
        self.start_nonce = nonce;
        self
    }

    /// Mines up to `count` blocks paying to `payout_script`, giving each
    /// block `max_tries_per_block` hash attempts.
    ///
    /// Returns the hashes of the accepted blocks in order. Running out of
    /// budget or being stopped ends the call early with the partial list.
    pub fn run(
        &self,
        payout_script: &[u8],
        count: u32,
        max_tries_per_block: u64,
        stop: &AtomicBool,
    ) -> MiningResult<Vec<BlockHash>> {
        let start_height = self.gateway.current_tip()?.height;
        let end_height = start_height.saturating_add(count);
        let mut height = start_height;

        let mut hashes = Vec::with_capacity(count.min(1_024) as usize);
        let mut remaining = max_tries_per_block;

        while height < end_height && !self.should_stop(stop) {
            let snapshot = MempoolSnapshot {
                update_counter: self.coordinator.mempool_version(),
                entries: self.mempool.entries(),
            };
            let template = self.builder.build(&snapshot, payout_script)?;
            let en = self.next_extra_nonce(template.previous_block_hash());
            let mut block = template.with_extra_nonce(en);
            let target = pow::target_from_bits(block.header.bits).ok_or_else(|| {
                MiningError::Internal(format!(
                    "template carries invalid bits {:08x}",
                    block.header.bits.to_consensus()
                ))
            })?;

            match self.grind(&mut block, &target, &mut remaining, stop) {
                Attempt::Found => {}
                Attempt::NonceExhausted => {
                    debug!(
                        height = template.height,
                        extra_nonce = en,
                        "nonce range exhausted, rebuilding"
                    );
                    continue;
                }
                Attempt::BudgetExhausted => {
                    info!(
                        height = template.height,
                        found = hashes.len(),
                        "search budget exhausted"
                    );
                    break;
                }
                Attempt::Stopped => {
                    info!(found = hashes.len(), "search stopped");
                    break;
                }
            }

            let hash = block.block_hash();
            let receipt = self.gateway.submit_block(Arc::new(block))?;
            if !receipt.accepted {
                warn!(%hash, "mined block was not accepted");
                return Err(MiningError::ValidationRejected(format!(
                    "block {hash} not accepted"
                )));
            }

            info!(%hash, height = template.height, extra_nonce = en, "mined block");
            hashes.push(hash);
            height += 1;
            remaining = max_tries_per_block;
        }

        Ok(hashes)
    }

    fn next_extra_nonce(&self, prev_blockhash: BlockHash) -> u32 {
        let mut extra_nonce = match self.extra_nonce.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        extra_nonce.next_for(prev_blockhash)
    }

    fn should_stop(&self, stop: &AtomicBool) -> bool {
        stop.load(Ordering::Relaxed) || self.coordinator.is_shutting_down()
    }

    fn grind(
        &self,
        block: &mut Block,
        target: &Target,
        remaining: &mut u64,
        stop: &AtomicBool,
    ) -> Attempt {
        block.header.nonce = self.start_nonce;
        let mut header = serialize(&block.header);

        loop {
            if self.should_stop(stop) {
                return Attempt::Stopped;
            }
            if *remaining == 0 {
                return Attempt::BudgetExhausted;
            }
            *remaining -= 1;

            if target.is_met_by(BlockHash::hash(&header)) {
                return Attempt::Found;
            }
            if block.header.nonce == u32::MAX {
                return Attempt::NonceExhausted;
            }
            block.header.nonce += 1;
            header[76..80].copy_from_slice(&block.header.nonce.to_le_bytes());
        }
    }
}
