//! Wire format for stop-and-wait file transfer.
//!
//! ```text
//! FileRequest  requester -> responder   1024 bytes
//!   [0..1024]   file name, UTF-8, zero padded
//!
//! SizeReply    responder -> requester   8 bytes
//!   [0..8]      file size (i64 BE), -1 = not found
//!
//! DataChunk    responder -> requester   4 + <=1020 bytes
//!   [0..4]      sequence number (u32 BE)
//!   [4..]       payload
//!
//! Ack          requester -> responder   4 bytes
//!   [0..4]      acknowledged sequence number (u32 BE)
//! ```
//!
//! Payload length is never on the wire: every chunk carries 1020 bytes except
//! the last, whose length follows from the announced file size. The responder
//! zero pads the last chunk to a full 1024-byte datagram. Decoders only read
//! the defined prefix, so an oversized receive buffer is fine.

use std::time::Duration;

use crate::error::CodecError;

/// Largest datagram either side sends.
pub const MAX_DATAGRAM: usize = 1024;

/// Encoded FileRequest length.
pub const REQUEST_LEN: usize = 1024;

/// Encoded SizeReply length.
pub const SIZE_REPLY_LEN: usize = 8;

/// Sequence number header on each DataChunk.
pub const SEQ_LEN: usize = 4;

/// Maximum payload bytes per chunk.
pub const CHUNK_PAYLOAD: usize = MAX_DATAGRAM - SEQ_LEN;

/// Encoded Ack length.
pub const ACK_LEN: usize = 4;

/// SizeReply sentinel: file not found or inaccessible.
pub const NOT_FOUND: i64 = -1;

/// Well-known responder port.
pub const DEFAULT_PORT: u16 = 9876;

/// Per-receive timeout used by both sides.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Encode a file request, zero padded to [`REQUEST_LEN`].
pub fn encode_request(name: &str) -> Result<[u8; REQUEST_LEN], CodecError> {
    let bytes = name.as_bytes();
    if bytes.len() > REQUEST_LEN {
        return Err(CodecError::NameTooLong {
            len: bytes.len(),
            max: REQUEST_LEN,
        });
    }
    let mut buf = [0u8; REQUEST_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode a file request, trimming padding and surrounding whitespace.
///
/// Unpadded requests (just the name bytes) are accepted as well.
pub fn decode_request(buf: &[u8]) -> Result<String, CodecError> {
    let raw = &buf[..buf.len().min(REQUEST_LEN)];
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidName)?;
    let name = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if name.chars().any(char::is_control) {
        return Err(CodecError::InvalidName);
    }
    Ok(name.to_string())
}

pub fn encode_size_reply(size: i64) -> [u8; SIZE_REPLY_LEN] {
    size.to_be_bytes()
}

pub fn decode_size_reply(buf: &[u8]) -> Result<i64, CodecError> {
    let bytes = prefix::<SIZE_REPLY_LEN>(buf, "size reply")?;
    Ok(i64::from_be_bytes(bytes))
}

/// Encode a data chunk: 4-byte big-endian sequence number, then the payload verbatim.
pub fn encode_chunk(seq: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > CHUNK_PAYLOAD {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: CHUNK_PAYLOAD,
        });
    }
    let mut buf = Vec::with_capacity(SEQ_LEN + payload.len());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a data chunk into its sequence number and payload slice.
pub fn decode_chunk(buf: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    let seq = u32::from_be_bytes(prefix::<SEQ_LEN>(buf, "data chunk")?);
    let end = buf.len().min(MAX_DATAGRAM);
    Ok((seq, &buf[SEQ_LEN..end]))
}

pub fn encode_ack(seq: u32) -> [u8; ACK_LEN] {
    seq.to_be_bytes()
}

pub fn decode_ack(buf: &[u8]) -> Result<u32, CodecError> {
    Ok(u32::from_be_bytes(prefix::<ACK_LEN>(buf, "ack")?))
}

/// Number of chunks needed for a file of `file_size` bytes.
pub fn chunk_count(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_PAYLOAD as u64)
}

/// Bytes of file data carried by chunk `seq`. Zero past the end of the file.
pub fn chunk_len(file_size: u64, seq: u64) -> usize {
    let offset = seq.saturating_mul(CHUNK_PAYLOAD as u64);
    file_size.saturating_sub(offset).min(CHUNK_PAYLOAD as u64) as usize
}

fn prefix<const N: usize>(buf: &[u8], kind: &'static str) -> Result<[u8; N], CodecError> {
    buf.get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or(CodecError::Truncated {
            kind,
            expected: N,
            actual: buf.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_padded_to_full_datagram() {
        let buf = encode_request("notes.txt").unwrap();
        assert_eq!(buf.len(), REQUEST_LEN);
        assert_eq!(&buf[..9], b"notes.txt");
        assert!(buf[9..].iter().all(|&b| b == 0));
        assert_eq!(decode_request(&buf).unwrap(), "notes.txt");
    }

    #[test]
    fn request_name_limit() {
        assert!(encode_request(&"a".repeat(REQUEST_LEN)).is_ok());
        let err = encode_request(&"a".repeat(REQUEST_LEN + 1)).unwrap_err();
        assert!(matches!(err, CodecError::NameTooLong { len: 1025, max: 1024 }));
    }

    #[test]
    fn decode_request_trims_padding_and_whitespace() {
        let mut buf = [b' '; REQUEST_LEN];
        buf[..12].copy_from_slice(b"  report.pdf");
        buf[20] = 0;
        assert_eq!(decode_request(&buf).unwrap(), "report.pdf");
    }

    #[test]
    fn decode_request_accepts_unpadded_name() {
        assert_eq!(decode_request(b"dir/data.bin").unwrap(), "dir/data.bin");
    }

    #[test]
    fn decode_request_rejects_binary_junk() {
        // A stray ack is not a file name.
        assert!(decode_request(&encode_ack(7)).is_err());
        assert!(decode_request(&[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn size_reply_is_big_endian() {
        assert_eq!(encode_size_reply(2500), [0, 0, 0, 0, 0, 0, 0x09, 0xC4]);
        assert_eq!(encode_size_reply(NOT_FOUND), [0xFF; 8]);
        assert_eq!(decode_size_reply(&[0xFF; 8]).unwrap(), NOT_FOUND);
    }

    #[test]
    fn size_reply_decodes_from_oversized_buffer() {
        let mut buf = [0xAAu8; MAX_DATAGRAM];
        buf[..8].copy_from_slice(&encode_size_reply(1_048_576));
        assert_eq!(decode_size_reply(&buf).unwrap(), 1_048_576);
    }

    #[test]
    fn truncated_messages_are_rejected() {
        assert!(matches!(
            decode_size_reply(&[0, 1, 2]),
            Err(CodecError::Truncated { expected: 8, actual: 3, .. })
        ));
        assert!(decode_ack(&[1, 2]).is_err());
        assert!(decode_chunk(&[]).is_err());
    }

    #[test]
    fn chunk_layout() {
        let buf = encode_chunk(0x0102_0304, b"xyz").unwrap();
        assert_eq!(buf, [1, 2, 3, 4, b'x', b'y', b'z']);

        let (seq, payload) = decode_chunk(&buf).unwrap();
        assert_eq!(seq, 0x0102_0304);
        assert_eq!(payload, b"xyz");
    }

    #[test]
    fn chunk_payload_limit() {
        assert!(encode_chunk(0, &[0u8; CHUNK_PAYLOAD]).is_ok());
        assert!(matches!(
            encode_chunk(0, &[0u8; CHUNK_PAYLOAD + 1]),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn ack_layout() {
        assert_eq!(encode_ack(258), [0, 0, 1, 2]);
        assert_eq!(decode_ack(&[0, 0, 1, 2, 99, 99]).unwrap(), 258);
    }

    #[test]
    fn chunk_math_for_2500_bytes() {
        assert_eq!(chunk_count(2500), 3);
        let lens: Vec<usize> = (0..3).map(|seq| chunk_len(2500, seq)).collect();
        assert_eq!(lens, vec![1020, 1020, 460]);
        assert_eq!(chunk_len(2500, 3), 0);
    }

    #[test]
    fn chunk_math_boundaries() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(1020), 1);
        assert_eq!(chunk_count(1021), 2);
        assert_eq!(chunk_len(1020, 0), 1020);
        assert_eq!(chunk_len(1021, 1), 1);
    }
}
