//! Bitcoin block and transaction types, plus the hex helpers the RPC
//! surface needs around them.

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::hashes::Hash as _;
use thiserror::Error;

pub use bitcoin::block::{Header as BlockHeader, Version as BlockVersion};
pub use bitcoin::{Block, BlockHash, CompactTarget, Target, Transaction, TxMerkleNode, Txid};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("{0}")]
    Consensus(#[from] encode::Error),
}

pub fn decode_hex_bytes(s: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(hex::decode(s.trim())?)
}

/// Consensus-decodes a hex string. Trailing bytes are an error.
pub fn from_hex<T: Decodable>(s: &str) -> Result<T, DecodeError> {
    Ok(encode::deserialize(&decode_hex_bytes(s)?)?)
}

pub fn to_hex<T: Encodable + ?Sized>(value: &T) -> String {
    encode::serialize_hex(value)
}

/// Transaction merkle root of `block`, all zeros when it has no transactions.
pub fn merkle_root(block: &Block) -> TxMerkleNode {
    block
        .compute_merkle_root()
        .unwrap_or_else(TxMerkleNode::all_zeros)
}

pub fn starts_with_coinbase(block: &Block) -> bool {
    block.txdata.first().is_some_and(Transaction::is_coinbase)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::Network;
    use bitcoin::constants::genesis_block;

    /// Bitcoin mainnet genesis block.
    pub(crate) const GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

    #[test]
    fn decodes_genesis_block() {
        let block: Block = from_hex(GENESIS_HEX).unwrap();
        assert_eq!(block, genesis_block(Network::Bitcoin));
        assert_eq!(
            block.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert!(starts_with_coinbase(&block));
        assert_eq!(merkle_root(&block), block.header.merkle_root);
        assert_eq!(to_hex(&block), GENESIS_HEX);
    }

    #[test]
    fn header_decode_requires_exact_length() {
        let short = "00".repeat(79);
        assert!(matches!(
            from_hex::<BlockHeader>(&short),
            Err(DecodeError::Consensus(_))
        ));
        let long = format!("{}00", to_hex(&genesis_block(Network::Bitcoin).header));
        assert!(from_hex::<BlockHeader>(&long).is_err());
    }

    #[test]
    fn bad_hex_is_reported_as_hex() {
        assert!(matches!(
            from_hex::<Transaction>("zz"),
            Err(DecodeError::Hex(_))
        ));
    }

    #[test]
    fn empty_block_has_zero_merkle_root() {
        let mut block = genesis_block(Network::Bitcoin);
        block.txdata.clear();
        assert_eq!(merkle_root(&block), TxMerkleNode::all_zeros());
        assert!(!starts_with_coinbase(&block));
    }
}
