//! Coinbase transaction construction and the extra-nonce counter that keeps
//! repeated builds at the same height distinct.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

use crate::primitives::{BlockHash, Transaction};

/// scriptSig carrying the block height followed by the extra nonce.
pub fn coinbase_script_sig(height: u32, extra_nonce: u32) -> ScriptBuf {
    ScriptBuf::builder()
        .push_int(i64::from(height))
        .push_int(i64::from(extra_nonce))
        .into_script()
}

pub struct CoinbaseSpec<'a> {
    pub height: u32,
    pub extra_nonce: u32,
    pub value: u64,
    pub payout_script: &'a [u8],
    /// Output script committing to the witness merkle root, if the block
    /// carries witness data.
    pub witness_commitment: Option<&'a [u8]>,
}

pub fn build_coinbase(spec: &CoinbaseSpec<'_>) -> Transaction {
    let mut witness = Witness::new();
    let mut output = vec![TxOut {
        value: Amount::from_sat(spec.value),
        script_pubkey: ScriptBuf::from_bytes(spec.payout_script.to_vec()),
    }];
    if let Some(commitment) = spec.witness_commitment {
        output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(commitment.to_vec()),
        });
        // witness reserved value
        witness.push([0u8; 32]);
    }

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: coinbase_script_sig(spec.height, spec.extra_nonce),
            sequence: Sequence::MAX,
            witness,
        }],
        output,
    }
}

/// Counter embedded in the coinbase. Restarts whenever the previous block
/// hash changes and increments before every use.
#[derive(Debug, Default)]
pub struct ExtraNonce {
    prev: Option<BlockHash>,
    counter: u32,
}

impl ExtraNonce {
    pub fn next_for(&mut self, prev_blockhash: BlockHash) -> u32 {
        if self.prev != Some(prev_blockhash) {
            self.prev = Some(prev_blockhash);
            self.counter = 0;
        }
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;

    #[test]
    fn height_push_uses_small_int_opcodes() {
        assert_eq!(coinbase_script_sig(1, 0).as_bytes(), &[0x51, 0x00]);
        assert_eq!(coinbase_script_sig(16, 1).as_bytes(), &[0x60, 0x51]);
        assert_eq!(coinbase_script_sig(17, 1).as_bytes(), &[0x01, 0x11, 0x51]);
        assert_eq!(
            coinbase_script_sig(200, 0x80).as_bytes(),
            &[0x02, 0xc8, 0x00, 0x02, 0x80, 0x00]
        );
    }

    #[test]
    fn coinbase_is_recognised_and_varies_with_extra_nonce() {
        let spec = |extra_nonce| CoinbaseSpec {
            height: 200,
            extra_nonce,
            value: 50_0000_0000,
            payout_script: &[0x51],
            witness_commitment: None,
        };
        let a = build_coinbase(&spec(1));
        let b = build_coinbase(&spec(2));
        assert!(a.is_coinbase());
        assert_eq!(a.output[0].value, Amount::from_sat(50_0000_0000));
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn segwit_coinbase_keeps_commitment_out_of_txid() {
        let commitment = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
        let tx = build_coinbase(&CoinbaseSpec {
            height: 300,
            extra_nonce: 1,
            value: 1,
            payout_script: &[0x51],
            witness_commitment: Some(&commitment),
        });
        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 2);
        assert_ne!(tx.txid().to_raw_hash(), tx.wtxid().to_raw_hash());
    }

    #[test]
    fn extra_nonce_resets_on_new_prev_hash() {
        let mut en = ExtraNonce::default();
        let a = BlockHash::hash(b"a");
        let b = BlockHash::hash(b"b");
        assert_eq!(en.next_for(a), 1);
        assert_eq!(en.next_for(a), 2);
        assert_eq!(en.next_for(b), 1);
    }
}
