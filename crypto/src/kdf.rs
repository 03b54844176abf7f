// Licensed under the Apache-2.0 license

use crate::digest::{hmac_sha384, SHA384_LEN};
use bkps_error::BkpsResult;
use zeroize::Zeroizing;

/// SP 800-108 counter mode KDF with HMAC-SHA384 as PRF.
///
/// Each block is `HMAC(key, i || label || 0x00 || context || L)` with the
/// counter `i` and the output length `L` in bits as big-endian u32.
pub fn kdf_hmac_sha384_counter(
    key: &[u8],
    label: &[u8],
    context: &[u8],
    out_len: usize,
) -> BkpsResult<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(out_len + SHA384_LEN));
    let len_bits = (out_len as u32).wrapping_mul(8).to_be_bytes();
    let mut counter = 1u32;
    while out.len() < out_len {
        let mut msg = Vec::with_capacity(4 + label.len() + 1 + context.len() + 4);
        msg.extend_from_slice(&counter.to_be_bytes());
        msg.extend_from_slice(label);
        msg.push(0x00);
        msg.extend_from_slice(context);
        msg.extend_from_slice(&len_bits);
        out.extend_from_slice(&hmac_sha384(key, &msg)?);
        counter += 1;
    }
    out.truncate(out_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_length_and_labels() {
        let key = [1u8; 48];
        let a = kdf_hmac_sha384_counter(&key, b"SEK", b"ctx", 32).unwrap();
        let b = kdf_hmac_sha384_counter(&key, b"SMK", b"ctx", 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(*a, *b);

        let long = kdf_hmac_sha384_counter(&key, b"SEK", b"ctx", 100).unwrap();
        assert_eq!(long.len(), 100);
    }
}
