//! Byte-repeat forward error correction for the audio medium.
//!
//! Each input byte is transmitted `repeat` times; the decoder takes a
//! bit-wise majority vote across the copies of each position. The code only
//! needs to survive narrow dropouts and isolated symbol errors, not
//! Gaussian noise.

/// Repeat every byte `repeat` times.
pub fn encode(data: &[u8], repeat: usize) -> Vec<u8> {
    let repeat = repeat.max(1);
    if repeat == 1 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() * repeat);
    for &byte in data {
        out.extend(std::iter::repeat(byte).take(repeat));
    }
    out
}

/// Collapse groups of `repeat` copies by bit-wise majority vote.
///
/// A trailing partial group is discarded. Ties (possible for even `repeat`)
/// resolve to 1.
pub fn decode(data: &[u8], repeat: usize) -> Vec<u8> {
    let repeat = repeat.max(1);
    if repeat == 1 {
        return data.to_vec();
    }

    let mut out = Vec::with_capacity(data.len() / repeat);
    for group in data.chunks_exact(repeat) {
        let mut byte = 0u8;
        for bit in 0..8 {
            let ones = group
                .iter()
                .filter(|copy| (**copy >> bit) & 1 == 1)
                .count();
            if ones * 2 >= repeat {
                byte |= 1 << bit;
            }
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        let data: Vec<u8> = (0..=255).collect();
        for repeat in [1, 2, 3, 5] {
            assert_eq!(decode(&encode(&data, repeat), repeat), data);
        }
    }

    #[test]
    fn repeat_three_survives_one_corrupt_copy_per_position() {
        // Corrupt one byte in copy 2 of positions 0, 20, 40, 63.
        let data: Vec<u8> = (0..64).map(|i| (i * 5) as u8).collect();
        let mut coded = encode(&data, 3);
        for position in [0usize, 20, 40, 63] {
            coded[position * 3 + 1] ^= 0xff;
        }
        assert_eq!(decode(&coded, 3), data);
    }

    #[test]
    fn repeat_three_survives_distinct_single_bit_errors_across_copies() {
        // Different bits corrupted in different copies of the same byte
        // still majority-vote back to the original per bit position.
        let data = vec![0b1010_0110u8];
        let mut coded = encode(&data, 3);
        coded[0] ^= 0b0000_0001;
        coded[1] ^= 0b1000_0000;
        assert_eq!(decode(&coded, 3), data);
    }

    #[test]
    fn trailing_partial_group_is_dropped() {
        let mut coded = encode(&[0x11, 0x22], 3);
        coded.truncate(coded.len() - 1);
        assert_eq!(decode(&coded, 3), vec![0x11]);
    }

    #[test]
    fn majority_loss_corrupts_predictably_not_silently() {
        let data = vec![0x00u8];
        let mut coded = encode(&data, 3);
        coded[0] = 0xff;
        coded[1] = 0xff;
        // Two of three copies corrupted: the vote goes the wrong way. The
        // framing CRC above this layer is what catches such frames.
        assert_eq!(decode(&coded, 3), vec![0xff]);
    }
}
