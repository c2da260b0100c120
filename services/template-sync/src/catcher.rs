//! Turns the engine's asynchronous block-checked notification into a
//! synchronous submission result.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{MiningError, MiningResult};
use crate::gateway::{BlockLookup, BlockStatus, ValidationGateway, ValidationState};
use crate::primitives::{self, Block};

pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    AcceptedNew,
    AcceptedDuplicate,
    Rejected(String),
    Error(String),
    /// No definitive signal observed. Carries the status string reported to
    /// the caller, e.g. `"inconclusive"` or `"duplicate-inconclusive"`.
    Inconclusive(&'static str),
}

impl SubmissionOutcome {
    /// BIP22 status: `None` for a newly accepted block, otherwise a string.
    pub fn status(&self) -> Option<String> {
        match self {
            SubmissionOutcome::AcceptedNew => None,
            SubmissionOutcome::AcceptedDuplicate => Some("duplicate".to_string()),
            SubmissionOutcome::Rejected(reason) => Some(reason.clone()),
            SubmissionOutcome::Error(message) => Some(message.clone()),
            SubmissionOutcome::Inconclusive(tag) => Some(tag.to_string()),
        }
    }
}

/// Translates a conclusive validation state.
pub fn outcome_from_state(state: &ValidationState) -> SubmissionOutcome {
    match state {
        ValidationState::Valid => SubmissionOutcome::AcceptedNew,
        ValidationState::Invalid { reason } if reason.is_empty() => {
            SubmissionOutcome::Rejected("rejected".to_string())
        }
        ValidationState::Invalid { reason } => SubmissionOutcome::Rejected(reason.clone()),
        ValidationState::Error { message } => SubmissionOutcome::Error(message.clone()),
    }
}

/// Status for a block the engine already knows, if it is known at all.
pub fn duplicate_outcome(lookup: BlockLookup) -> Option<SubmissionOutcome> {
    match lookup {
        BlockLookup::Unknown => None,
        BlockLookup::Known(BlockStatus::Valid) => Some(SubmissionOutcome::AcceptedDuplicate),
        BlockLookup::Known(BlockStatus::Failed) => {
            Some(SubmissionOutcome::Rejected("duplicate-invalid".to_string()))
        }
        BlockLookup::Known(BlockStatus::Indeterminate) => {
            Some(SubmissionOutcome::Inconclusive("duplicate-inconclusive"))
        }
    }
}

pub struct SubmissionCatcher<'a> {
    gateway: &'a dyn ValidationGateway,
    notification_timeout: Duration,
}

impl<'a> SubmissionCatcher<'a> {
    pub fn new(gateway: &'a dyn ValidationGateway, notification_timeout: Duration) -> Self {
        SubmissionCatcher {
            gateway,
            notification_timeout,
        }
    }

    pub fn submit(&self, block: Block) -> MiningResult<SubmissionOutcome> {
        if !primitives::starts_with_coinbase(&block) {
            return Err(MiningError::InvalidInput(
                "Block does not start with a coinbase".to_string(),
            ));
        }

        let hash = block.block_hash();
        if let Some(outcome) = duplicate_outcome(self.gateway.lookup_block(&hash)?) {
            info!(%hash, ?outcome, "submitted block already known");
            return Ok(outcome);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let subscription = self.gateway.block_checked().subscribe(move |checked, state| {
            if *checked == hash {
                let _ = tx.try_send(state.clone());
            }
        });

        let receipt = self.gateway.submit_block(Arc::new(block))?;
        let checked = if receipt.accepted && !receipt.new_block {
            None
        } else {
            rx.recv_timeout(self.notification_timeout).ok()
        };
        drop(subscription);

        let outcome = if receipt.accepted && !receipt.new_block {
            SubmissionOutcome::AcceptedDuplicate
        } else {
            match checked {
                Some(state) => outcome_from_state(&state),
                None => {
                    debug!(%hash, "no block-checked notification arrived");
                    SubmissionOutcome::Inconclusive("inconclusive")
                }
            }
        };

        info!(%hash, ?outcome, "block submission finished");
        Ok(outcome)
    }
}
