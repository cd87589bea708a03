// Record framing: `[len:u32 LE][payload][pad to 4-byte multiple]`.
//
// Grounded on the length-prefixed shape of `transaction::wal::WALEntry`, with
// the checksum dropped: the on-disk layout is fixed exactly, and callers read
// back entries at offsets computed from that exact layout, so an extra field
// would break them.

/// Size of the length prefix, in bytes.
pub const HEADER_SIZE: u32 = 4;

/// Round `len` up to the next multiple of 4.
#[inline]
pub const fn align4(len: u32) -> u32 {
    (len + 3) & !3
}

/// Total bytes a single record of `payload_len` occupies once framed and
/// padded: `4 + align4(payload_len)`.
#[inline]
pub const fn framed_len(payload_len: u32) -> u32 {
    HEADER_SIZE + align4(payload_len)
}

/// Total bytes a batch of records occupies: the sum of each entry's
/// `framed_len`.
pub fn batch_framed_len(payload_lens: &[u32]) -> u32 {
    payload_lens.iter().copied().map(framed_len).sum()
}

/// Write one framed record into `dst[0..framed_len(payload.len())]`.
///
/// Panics if `dst` is too small; callers are expected to have sized the
/// destination from `framed_len` first (this runs under an epoch guard on a
/// page the allocator has already reserved exactly that many bytes in).
pub fn encode(dst: &mut [u8], payload: &[u8]) {
    let len = payload.len() as u32;
    let total = framed_len(len) as usize;
    assert!(dst.len() >= total, "destination too small for record");
    dst[0..4].copy_from_slice(&len.to_le_bytes());
    dst[4..4 + payload.len()].copy_from_slice(payload);
    for b in &mut dst[4 + payload.len()..total] {
        *b = 0;
    }
}

/// Write a batch of records sequentially into `dst`, returning the total
/// bytes written (equal to `batch_framed_len`).
pub fn encode_batch(dst: &mut [u8], payloads: &[&[u8]]) -> u32 {
    let mut offset = 0usize;
    for payload in payloads {
        let total = framed_len(payload.len() as u32) as usize;
        encode(&mut dst[offset..offset + total], payload);
        offset += total;
    }
    offset as u32
}

/// Decode errors from a framed buffer: a negative/oversized length prefix
/// indicates corruption rather than a truncated read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The length prefix is larger than `max_len` (or negative, which cannot
    /// occur in an unsigned read but is checked against the widened i64 for
    /// symmetry with corrupt on-disk data).
    CorruptLength(i64),
    /// Fewer than `4 + length` bytes are present in the supplied buffer; the
    /// caller should re-issue the read with a larger estimate.
    Underrun,
}

/// Read the length prefix out of `buf`, validating it against `max_len`
/// (normally the page size).
pub fn read_length_prefix(buf: &[u8], max_len: u32) -> Result<u32, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Underrun);
    }
    let raw = i64::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
    if raw < 0 || raw > i64::from(max_len) {
        return Err(DecodeError::CorruptLength(raw));
    }
    Ok(raw as u32)
}

/// Decode a single record's payload out of `buf`, given an already-validated
/// `length`. Returns `Err(Underrun)` if `buf` doesn't hold the full payload
/// yet (caller should re-read with a bigger buffer).
pub fn decode_payload(buf: &[u8], length: u32) -> Result<&[u8], DecodeError> {
    let needed = 4 + length as usize;
    if buf.len() < needed {
        return Err(DecodeError::Underrun);
    }
    Ok(&buf[4..needed])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align4_rounds_up() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(3), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
    }

    #[test]
    fn three_byte_payload_frames_to_eight_bytes() {
        assert_eq!(framed_len(3), 8);
    }

    #[test]
    fn batch_of_unaligned_payloads_sums_framed_lengths() {
        assert_eq!(batch_framed_len(&[1, 2, 4]), 24);
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"hello";
        let total = framed_len(payload.len() as u32) as usize;
        let mut buf = vec![0u8; total];
        encode(&mut buf, payload);
        let len = read_length_prefix(&buf, 4096).unwrap();
        assert_eq!(len, payload.len() as u32);
        assert_eq!(decode_payload(&buf, len).unwrap(), payload);
    }

    #[test]
    fn batch_encode_decode_round_trip() {
        let payloads: [&[u8]; 3] = [&[0xAA], &[0xBB, 0xBB], &[0xCC, 0xCC, 0xCC, 0xCC]];
        let lens: Vec<u32> = payloads.iter().map(|p| p.len() as u32).collect();
        let total = batch_framed_len(&lens) as usize;
        let mut buf = vec![0u8; total];
        let written = encode_batch(&mut buf, &payloads);
        assert_eq!(written as usize, total);

        let mut offset = 0usize;
        for payload in &payloads {
            let len = read_length_prefix(&buf[offset..], 4096).unwrap();
            assert_eq!(len as usize, payload.len());
            assert_eq!(decode_payload(&buf[offset..], len).unwrap(), *payload);
            offset += framed_len(len) as usize;
        }
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&(10_000_000u32).to_le_bytes());
        assert_eq!(
            read_length_prefix(&buf, 4096),
            Err(DecodeError::CorruptLength(10_000_000))
        );
    }

    #[test]
    fn underrun_requests_retry() {
        let payload = b"0123456789";
        let total = framed_len(payload.len() as u32) as usize;
        let mut buf = vec![0u8; total];
        encode(&mut buf, payload);
        let len = read_length_prefix(&buf, 4096).unwrap();
        assert_eq!(decode_payload(&buf[..6], len), Err(DecodeError::Underrun));
    }
}
