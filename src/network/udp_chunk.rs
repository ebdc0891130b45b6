//! Binary codec for UDP chunks. A message is split into chunks that each travel in a datagram
//!  of their own, prefixed with a fixed 17 byte header:
//!
//! ```ascii
//! 0: mark byte '!'
//! 1: sequence (u64, big endian) - shared by all chunks of one message
//! 9: total number of chunks (i32, big endian)
//! 13: index of this chunk (i32, big endian)
//! 17: chunk data
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::safe_converter::PrecheckedCast;


pub const CHUNK_MARK: u8 = b'!';
pub const HEADER_LEN: usize = 17;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChunkHeader {
    pub sequence: u64,
    pub total_chunks: i32,
    pub chunk: i32,
}

pub fn encode_header(sequence: u64, total_chunks: i32, chunk: i32) -> [u8; HEADER_LEN] {
    let mut result = [0u8; HEADER_LEN];
    let mut buf = &mut result[..];
    buf.put_u8(CHUNK_MARK);
    buf.put_u64(sequence);
    buf.put_i32(total_chunks);
    buf.put_i32(chunk);
    result
}

/// `None` if the buffer is too short for a header or does not start with the mark byte
pub fn decode_header(packet: &[u8]) -> Option<ChunkHeader> {
    if packet.len() < HEADER_LEN || packet[0] != CHUNK_MARK {
        return None;
    }
    let mut buf = &packet[1..HEADER_LEN];
    Some(ChunkHeader {
        sequence: buf.get_u64(),
        total_chunks: buf.get_i32(),
        chunk: buf.get_i32(),
    })
}

/// One datagram's worth of a fragmented message. Chunks exist only for the duration of a
///  single send or receive.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UdpChunk {
    pub header: ChunkHeader,
    pub data: Bytes,
}

impl UdpChunk {
    /// `None` marks an invalid packet, which the receiver drops
    pub fn decode(packet: &[u8]) -> Option<UdpChunk> {
        let header = decode_header(packet)?;
        Some(UdpChunk {
            header,
            data: Bytes::copy_from_slice(&packet[HEADER_LEN..]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_slice(&encode_header(self.header.sequence, self.header.total_chunks, self.header.chunk));
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Splits a payload into `ceil(len / chunk_size)` chunks sharing one sequence number. An empty
///  payload yields no chunks.
pub fn fragment(sequence: u64, payload: &Bytes, chunk_size: usize) -> anyhow::Result<Vec<UdpChunk>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let total = payload.len().div_ceil(chunk_size);
    if total > i32::MAX as usize {
        anyhow::bail!("payload of {} bytes needs more than {} chunks", payload.len(), i32::MAX);
    }
    let total_chunks: i32 = total.prechecked_cast();

    let chunks = (0..total)
        .map(|i| {
            let start = i * chunk_size;
            let end = usize::min(start + chunk_size, payload.len());
            UdpChunk {
                header: ChunkHeader {
                    sequence,
                    total_chunks,
                    chunk: i.prechecked_cast(),
                },
                data: payload.slice(start..end),
            }
        })
        .collect();
    Ok(chunks)
}
