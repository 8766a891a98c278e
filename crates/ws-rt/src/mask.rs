//! XOR payload masking per RFC 6455 Section 5.3.
//!
//! Masking is symmetric: applying the same key twice returns the original
//! bytes, so [`mask`] and [`unmask`] are the same operation.

/// Apply or remove the 4-byte XOR mask in place.
pub fn apply_mask(payload: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Return an unmasked copy of `payload`.
pub fn unmask(payload: &[u8], key: &[u8; 4]) -> Vec<u8> {
    let mut out = payload.to_vec();
    apply_mask(&mut out, key);
    out
}

/// Return a masked copy of `payload`.
pub fn mask(payload: &[u8], key: &[u8; 4]) -> Vec<u8> {
    unmask(payload, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mask_roundtrip() {
        let original = b"Hello".to_vec();
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut masked = original.clone();
        apply_mask(&mut masked, &key);
        assert_ne!(masked, original, "masked should differ from original");
        apply_mask(&mut masked, &key);
        assert_eq!(masked, original, "unmasked should equal original");
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 Section 5.7: "Hello" masked with 37 fa 21 3d.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        assert_eq!(mask(b"Hello", &key), vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        assert_eq!(unmask(&[0x7f, 0x9f, 0x4d, 0x51, 0x58], &key), b"Hello");
    }

    #[test]
    fn test_zero_key_is_identity() {
        assert_eq!(unmask(b"payload", &[0; 4]), b"payload");
    }

    #[test]
    fn test_empty_payload() {
        assert!(unmask(&[], &[1, 2, 3, 4]).is_empty());
    }

    proptest! {
        #[test]
        fn mask_is_an_involution(
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
            key in any::<[u8; 4]>(),
        ) {
            prop_assert_eq!(unmask(&mask(&payload, &key), &key), payload);
        }
    }
}
