//! URL-safe base64 without padding, the alphabet used by the textual form of ENRs:
//! https://datatracker.ietf.org/doc/html/rfc4648#section-5

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

fn alphabet_to_byte(byte: u8) -> Option<u8> {
    match byte {
        b'A'..=b'Z' => Some(byte - b'A'),
        b'a'..=b'z' => Some(byte - b'a' + 26),
        b'0'..=b'9' => Some(byte - b'0' + 52),
        b'-' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

pub fn encode(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(bytes.len().div_ceil(3) * 4);

    for block in bytes.chunks(3) {
        // each block is made up of as many as 24 bits (3 bytes)
        let mut bits = 0u32;
        for (i, byte) in block.iter().enumerate() {
            bits |= u32::from(*byte) << (16 - 8 * i);
        }
        // a block of n bytes needs n + 1 characters
        for i in 0..=block.len() {
            let index = (bits >> (18 - 6 * i)) & 0x3f;
            result.push(ALPHABET[index as usize] as char);
        }
    }

    result
}

/// Decodes unpadded or padded input. Returns `None` on characters outside the alphabet.
pub fn decode(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(bytes.len() * 3 / 4);
    let mut carry = 0u32;
    let mut carry_bits = 0;

    for byte in bytes.iter().take_while(|byte| **byte != b'=') {
        carry = (carry << 6) | u32::from(alphabet_to_byte(*byte)?);
        carry_bits += 6;
        if carry_bits >= 8 {
            carry_bits -= 8;
            result.push((carry >> carry_bits) as u8);
            carry &= (1 << carry_bits) - 1;
        }
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_without_padding() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(b"f"), "Zg");
        assert_eq!(encode(b"fo"), "Zm8");
        assert_eq!(encode(b"foo"), "Zm9v");
        assert_eq!(encode(b"foob"), "Zm9vYg");
        assert_eq!(encode(&[0xfb, 0xff]), "-_8");
    }

    #[test]
    fn decodes_padded_and_unpadded() {
        assert_eq!(decode(b"Zm9vYg").unwrap(), b"foob");
        assert_eq!(decode(b"Zm9vYg==").unwrap(), b"foob");
        assert_eq!(decode(b"-_8").unwrap(), vec![0xfb, 0xff]);
        assert!(decode(b"Zm9v+g").is_none());
    }
}
