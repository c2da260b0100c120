use std::collections::HashMap;

use bitcoin::hashes::Hash as _;
use thiserror::Error;

use crate::coinbase::{self, CoinbaseSpec};
use crate::primitives::{
    self, Block, BlockHash, BlockHeader, BlockVersion, CompactTarget, Transaction, TxMerkleNode,
    Txid,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transaction at position {position} depends on a later transaction")]
    DependencyOrder { position: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

/// One non-coinbase transaction of a template with its selection metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTx {
    pub tx: Transaction,
    pub fee: u64,
    pub sigop_cost: u64,
    pub weight: u64,
    /// 1-based block positions (the coinbase is position 0) of earlier
    /// transactions whose outputs this one spends.
    pub depends: Vec<usize>,
}

/// What a builder hands over to be assembled into a `BlockTemplate`.
#[derive(Debug, Clone)]
pub struct TemplateParts {
    pub version: BlockVersion,
    pub prev_blockhash: BlockHash,
    pub bits: CompactTarget,
    pub time: u32,
    pub min_time: u32,
    pub height: u32,
    pub coinbase_value: u64,
    pub payout_script: Vec<u8>,
    pub witness_commitment: Option<Vec<u8>>,
    /// (transaction, fee, sigop cost) in block order.
    pub entries: Vec<(Transaction, u64, u64)>,
    pub sigop_limit: u64,
    pub size_limit: u64,
    pub rules: Vec<String>,
}

/// A fully assembled candidate block that has not been proven yet.
///
/// Immutable once built: search code takes a private copy through
/// [`BlockTemplate::with_extra_nonce`] before touching the nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub height: u32,
    pub min_time: u32,
    pub coinbase_value: u64,
    pub coinbase: Transaction,
    pub payout_script: Vec<u8>,
    pub witness_commitment: Option<Vec<u8>>,
    pub transactions: Vec<TemplateTx>,
    pub sigop_limit: u64,
    pub size_limit: u64,
    pub rules: Vec<String>,
}

impl BlockTemplate {
    pub fn assemble(parts: TemplateParts) -> Result<Self, BuildError> {
        let coinbase = coinbase::build_coinbase(&CoinbaseSpec {
            height: parts.height,
            extra_nonce: 0,
            value: parts.coinbase_value,
            payout_script: &parts.payout_script,
            witness_commitment: parts.witness_commitment.as_deref(),
        });

        let later: HashMap<Txid, usize> = parts
            .entries
            .iter()
            .enumerate()
            .map(|(i, (tx, _, _))| (tx.txid(), i + 1))
            .collect();

        let mut positions: HashMap<Txid, usize> = HashMap::new();
        positions.insert(coinbase.txid(), 0);

        let mut transactions = Vec::with_capacity(parts.entries.len());
        for (i, (tx, fee, sigop_cost)) in parts.entries.into_iter().enumerate() {
            let position = i + 1;
            let mut depends = Vec::new();
            for input in &tx.input {
                let spent = input.previous_output.txid;
                if let Some(&p) = positions.get(&spent) {
                    if !depends.contains(&p) {
                        depends.push(p);
                    }
                } else if later.get(&spent).is_some_and(|&p| p >= position) {
                    return Err(BuildError::DependencyOrder { position });
                }
            }
            positions.insert(tx.txid(), position);
            transactions.push(TemplateTx {
                weight: tx.weight().to_wu(),
                tx,
                fee,
                sigop_cost,
                depends,
            });
        }

        let mut template = BlockTemplate {
            header: BlockHeader {
                version: parts.version,
                prev_blockhash: parts.prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: parts.time.max(parts.min_time),
                bits: parts.bits,
                nonce: 0,
            },
            height: parts.height,
            min_time: parts.min_time,
            coinbase_value: parts.coinbase_value,
            coinbase,
            payout_script: parts.payout_script,
            witness_commitment: parts.witness_commitment,
            transactions,
            sigop_limit: parts.sigop_limit,
            size_limit: parts.size_limit,
            rules: parts.rules,
        };
        template.header.merkle_root = primitives::merkle_root(&template.to_block());
        Ok(template)
    }

    pub fn previous_block_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }

    pub fn bits(&self) -> CompactTarget {
        self.header.bits
    }

    pub fn weight(&self) -> u64 {
        self.to_block().weight().to_wu()
    }

    pub fn to_block(&self) -> Block {
        let mut txdata = Vec::with_capacity(self.transactions.len() + 1);
        txdata.push(self.coinbase.clone());
        txdata.extend(self.transactions.iter().map(|t| t.tx.clone()));
        Block {
            header: self.header,
            txdata,
        }
    }

    /// Private copy of the block with a coinbase carrying `extra_nonce` and
    /// the merkle root recomputed to match.
    pub fn with_extra_nonce(&self, extra_nonce: u32) -> Block {
        let mut block = self.to_block();
        block.txdata[0] = coinbase::build_coinbase(&CoinbaseSpec {
            height: self.height,
            extra_nonce,
            value: self.coinbase_value,
            payout_script: &self.payout_script,
            witness_commitment: self.witness_commitment.as_deref(),
        });
        block.header.merkle_root = primitives::merkle_root(&block);
        block.header.nonce = 0;
        block
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash as _;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    /// Minimal one-in one-out transaction spending `prev:vout`.
    pub(crate) fn spend(prev: Txid, vout: u32, tag: u8) -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: prev, vout },
                script_sig: ScriptBuf::from_bytes(vec![0x01, tag]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    pub(crate) fn parts(entries: Vec<(Transaction, u64, u64)>) -> TemplateParts {
        TemplateParts {
            version: BlockVersion::from_consensus(0x2000_0000),
            prev_blockhash: BlockHash::hash(b"tip"),
            bits: CompactTarget::from_consensus(0x207f_ffff),
            time: 1_700_000_000,
            min_time: 1_600_000_000,
            height: 101,
            coinbase_value: 50_0000_0000,
            payout_script: vec![0x51],
            witness_commitment: None,
            entries,
            sigop_limit: 80_000,
            size_limit: 4_000_000,
            rules: vec!["csv".into()],
        }
    }

    #[test]
    fn depends_point_at_earlier_positions() {
        let a = spend(Txid::hash(b"utxo"), 0, 1);
        let b = spend(a.txid(), 0, 2);
        let c = spend(b.txid(), 0, 3);
        let tpl = BlockTemplate::assemble(parts(vec![(a, 10, 4), (b, 20, 4), (c, 30, 4)])).unwrap();
        assert!(tpl.transactions[0].depends.is_empty());
        assert_eq!(tpl.transactions[1].depends, vec![1]);
        assert_eq!(tpl.transactions[2].depends, vec![2]);
        assert_eq!(tpl.transactions.iter().map(|t| t.fee).sum::<u64>(), 60);
    }

    #[test]
    fn rejects_forward_dependency() {
        let a = spend(Txid::hash(b"utxo"), 0, 1);
        let b = spend(a.txid(), 0, 2);
        let err = BlockTemplate::assemble(parts(vec![(b, 20, 4), (a, 10, 4)])).unwrap_err();
        assert!(matches!(err, BuildError::DependencyOrder { position: 1 }));
    }

    #[test]
    fn extra_nonce_changes_merkle_root_only() {
        let tpl = BlockTemplate::assemble(parts(Vec::new())).unwrap();
        let block = tpl.with_extra_nonce(7);
        assert_ne!(block.header.merkle_root, tpl.header.merkle_root);
        assert!(block.check_merkle_root());
        assert_eq!(block.header.prev_blockhash, tpl.previous_block_hash());
        assert!(primitives::starts_with_coinbase(&block));
        assert!(tpl.to_block().check_merkle_root());
    }

    #[test]
    fn time_never_below_min_time() {
        let mut p = parts(Vec::new());
        p.time = 10;
        let tpl = BlockTemplate::assemble(p).unwrap();
        assert_eq!(tpl.header.time, tpl.min_time);
    }
}
