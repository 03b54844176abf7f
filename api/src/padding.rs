// Licensed under the Apache-2.0 license

/// Number of zero bytes needed to extend `len` to a multiple of `boundary`.
pub fn padding_len(len: usize, boundary: usize) -> usize {
    if boundary == 0 {
        return 0;
    }
    (boundary - len % boundary) % boundary
}

/// Returns `data` extended with zero bytes to a multiple of `boundary`.
pub fn pad_to_boundary(data: &[u8], boundary: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + padding_len(data.len(), boundary));
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding_len(data.len(), boundary), 0);
    padded
}
