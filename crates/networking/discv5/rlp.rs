//! Flat item/list helpers on top of `alloy_rlp`, used where the structure is not
//! known statically (ENR key/value pairs) or where raw encoded items must be kept.

use alloy_rlp::{Error as RLPError, Header};

/// Encodes a single byte string.
pub fn encode_item(item: &[u8]) -> Vec<u8> {
    alloy_rlp::encode(item)
}

/// Returns the next item still encoded (header included) and advances `buf` past it.
pub fn split_item<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], RLPError> {
    let start: &'a [u8] = *buf;
    let mut cursor: &'a [u8] = *buf;
    let header = Header::decode(&mut cursor)?;
    if cursor.len() < header.payload_length {
        return Err(RLPError::InputTooShort);
    }
    let consumed = start.len() - cursor.len() + header.payload_length;
    *buf = &start[consumed..];
    Ok(&start[..consumed])
}

/// Returns the payload of the list at the front of `buf` and advances past it.
pub fn list_payload<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], RLPError> {
    let mut cursor: &'a [u8] = *buf;
    let header = Header::decode(&mut cursor)?;
    if !header.list {
        return Err(RLPError::UnexpectedString);
    }
    if cursor.len() < header.payload_length {
        return Err(RLPError::InputTooShort);
    }
    let (payload, rest) = cursor.split_at(header.payload_length);
    *buf = rest;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};
    use hex_literal::hex;

    /// Wraps already encoded items into a list.
    fn encode_list<T: AsRef<[u8]>>(encoded_items: &[T]) -> Vec<u8> {
        let payload_length = encoded_items.iter().map(|item| item.as_ref().len()).sum();
        let mut out =
            Vec::with_capacity(payload_length + alloy_rlp::length_of_length(payload_length));
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        for item in encoded_items {
            out.put_slice(item.as_ref());
        }
        out
    }

    /// Decodes every byte string in `data`, descending into nested lists.
    fn decode_flat(mut data: &[u8]) -> Result<Vec<Bytes>, RLPError> {
        let mut items = Vec::new();
        while !data.is_empty() {
            flatten_into(&mut data, &mut items)?;
        }
        Ok(items)
    }

    fn flatten_into<'a>(buf: &mut &'a [u8], items: &mut Vec<Bytes>) -> Result<(), RLPError> {
        let mut cursor: &'a [u8] = *buf;
        let header = Header::decode(&mut cursor)?;
        if cursor.len() < header.payload_length {
            return Err(RLPError::InputTooShort);
        }
        let (mut payload, rest) = cursor.split_at(header.payload_length);
        *buf = rest;
        if header.list {
            while !payload.is_empty() {
                flatten_into(&mut payload, items)?;
            }
        } else {
            items.push(Bytes::copy_from_slice(payload));
        }
        Ok(())
    }

    #[test]
    fn encodes_items_and_lists() {
        assert_eq!(encode_item(b"dog"), hex!("83646f67").to_vec());
        assert_eq!(encode_item(&[0x01]), vec![0x01]);
        let list = encode_list(&[encode_item(b"cat"), encode_item(b"dog")]);
        assert_eq!(list, hex!("c88363617483646f67").to_vec());
    }

    #[test]
    fn decode_flattens_nested_lists() {
        // [ "cat", [ "dog", 0x01 ] ]
        let nested = encode_list(&[
            encode_item(b"cat"),
            encode_list(&[encode_item(b"dog"), encode_item(&[0x01])]),
        ]);
        let items = decode_flat(&nested).unwrap();
        assert_eq!(
            items,
            vec![
                Bytes::from_static(b"cat"),
                Bytes::from_static(b"dog"),
                Bytes::from_static(&[0x01]),
            ]
        );
    }

    #[test]
    fn list_payload_skips_header() {
        let mut buf = &hex!("c88363617483646f6701")[..];
        assert_eq!(list_payload(&mut buf).unwrap(), hex!("8363617483646f67"));
        assert_eq!(buf, [0x01]);
    }

    #[test]
    fn split_item_keeps_headers() {
        let data = [encode_item(b"cat"), encode_item(&[0x05])].concat();
        let mut buf = data.as_slice();
        assert_eq!(split_item(&mut buf).unwrap(), hex!("83636174"));
        assert_eq!(split_item(&mut buf).unwrap(), [0x05]);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(decode_flat(&hex!("8363")).is_err());
        let mut buf = &hex!("c883636174")[..];
        assert!(list_payload(&mut buf).is_err());
    }
}
