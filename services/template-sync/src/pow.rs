use crate::primitives::{BlockHash, CompactTarget, Target};

/// Expands compact `bits`. Negative, zero and overflowing encodings yield
/// `None`, matching what consensus refuses as a target.
pub fn target_from_bits(bits: CompactTarget) -> Option<Target> {
    let raw = bits.to_consensus();
    let size = raw >> 24;
    let word = raw & 0x007f_ffff;
    if word != 0 && raw & 0x0080_0000 != 0 {
        return None;
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return None;
    }
    let target = Target::from_compact(bits);
    (target != Target::ZERO).then_some(target)
}

pub fn check_proof_of_work(hash: BlockHash, bits: CompactTarget) -> bool {
    target_from_bits(bits).is_some_and(|t| t.is_met_by(hash))
}

/// Big-endian hex, the form getblocktemplate reports `target` in.
pub fn target_hex(target: &Target) -> String {
    hex::encode(target.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;

    fn bits(raw: u32) -> CompactTarget {
        CompactTarget::from_consensus(raw)
    }

    #[test]
    fn expands_mainnet_genesis_bits() {
        let t = target_from_bits(bits(0x1d00ffff)).unwrap();
        assert_eq!(
            target_hex(&t),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(t, Target::MAX);
    }

    #[test]
    fn expands_regtest_bits() {
        let t = target_from_bits(bits(0x207fffff)).unwrap();
        assert!(target_hex(&t).starts_with("7fffff00"));
    }

    #[test]
    fn rejects_negative_zero_and_overflow() {
        assert!(target_from_bits(bits(0x04923456)).is_none());
        assert!(target_from_bits(bits(0x01003456)).is_none());
        assert!(target_from_bits(bits(0xff123456)).is_none());
        assert!(target_from_bits(bits(0)).is_none());
    }

    #[test]
    fn genesis_hash_meets_its_own_bits() {
        let hash: BlockHash = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            .parse()
            .unwrap();
        assert!(check_proof_of_work(hash, bits(0x1d00ffff)));
        assert!(!check_proof_of_work(hash, bits(0x1b00ffff)));
        assert!(!check_proof_of_work(BlockHash::all_zeros(), bits(0x04923456)));
    }
}
