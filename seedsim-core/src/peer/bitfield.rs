//! Synthetic piece availability.

use bytes::Bytes;

use crate::random::RandomSource;

/// Builds a bitfield with roughly `completion` of the pieces marked present.
///
/// A completion of 1.0 sets every piece; spare bits in the final byte are
/// always left clear as BEP 3 requires.
pub fn synthetic_bitfield(piece_count: u32, completion: f64, rng: &mut dyn RandomSource) -> Bytes {
    let byte_len = (piece_count as usize).div_ceil(8);
    let mut bits = vec![0u8; byte_len];

    let completion = completion.clamp(0.0, 1.0);
    for index in 0..piece_count as usize {
        let present = completion >= 1.0 || rng.chance(completion);
        if present {
            bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    Bytes::from(bits)
}

/// Returns true if `index` is set in `bitfield`.
pub fn has_piece(bitfield: &[u8], index: u32) -> bool {
    let byte = index as usize / 8;
    bitfield
        .get(byte)
        .is_some_and(|b| b & (0x80 >> (index % 8)) != 0)
}

/// Number of pieces marked present.
pub fn count_pieces(bitfield: &[u8]) -> u32 {
    bitfield.iter().map(|b| b.count_ones()).sum()
}

/// Collects the indices of present pieces.
pub fn present_pieces(bitfield: &[u8], piece_count: u32) -> Vec<u32> {
    (0..piece_count).filter(|&i| has_piece(bitfield, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{ScriptedRandom, SeededRandom};

    #[test]
    fn test_full_bitfield_has_clear_spare_bits() {
        let mut rng = SeededRandom::from_seed(1);
        let bits = synthetic_bitfield(10, 1.0, &mut rng);

        assert_eq!(bits.len(), 2);
        assert_eq!(bits[0], 0xff);
        assert_eq!(bits[1], 0b1100_0000);
        assert_eq!(count_pieces(&bits), 10);
    }

    #[test]
    fn test_empty_bitfield() {
        let mut rng = SeededRandom::from_seed(1);
        let bits = synthetic_bitfield(17, 0.0, &mut rng);
        assert_eq!(bits.len(), 3);
        assert_eq!(count_pieces(&bits), 0);
    }

    #[test]
    fn test_partial_follows_random_source() {
        // Below 0.5 sets the bit, above leaves it clear
        let mut rng = ScriptedRandom::new([0.1, 0.9, 0.2, 0.8], 0.9);
        let bits = synthetic_bitfield(4, 0.5, &mut rng);
        assert_eq!(present_pieces(&bits, 4), vec![0, 2]);
        assert!(has_piece(&bits, 0));
        assert!(!has_piece(&bits, 1));
        assert!(!has_piece(&bits, 100));
    }
}
