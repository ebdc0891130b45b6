//! Wire framing for TCP streams: every payload is sent as `'!' <decimal length> ':' <payload>`.
//!
//! The decoder works on an arbitrary byte stream. It skips everything before a mark byte, so a
//!  stream that got out of step resynchronizes at the next `'!'` - but only while it is looking
//!  for a header. Once a length was parsed, the body is consumed as-is, mark bytes included.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};


pub const FRAME_MARK: u8 = b'!';
pub const LENGTH_DELIMITER: u8 = b':';

/// more digits than this can not be a valid length on any platform
const MAX_LENGTH_DIGITS: usize = 20;

pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) {
    let len = payload.len().to_string();
    buf.reserve(len.len() + payload.len() + 2);
    buf.put_u8(FRAME_MARK);
    buf.put_slice(len.as_bytes());
    buf.put_u8(LENGTH_DELIMITER);
    buf.put_slice(payload);
}

/// Streaming frame decoder, one per connection. Bytes are appended as they arrive from the
///  socket, complete payloads are taken out with [FrameDecoder::next_frame].
pub struct FrameDecoder {
    buf: BytesMut,
    /// length of the frame whose header was consumed, but whose body is not complete yet
    body_len: Option<usize>,
    /// body bytes of a rejected frame that did not arrive yet
    skip: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            body_len: None,
            skip: 0,
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        let skipped = self.skip.min(data.len());
        self.skip -= skipped;
        self.buf.extend_from_slice(&data[skipped..]);
    }

    /// number of buffered bytes that were not delivered yet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete payload, or `None` if more data is needed. An `Err` means a
    ///  malformed header; the offending mark byte is skipped, so calling this again continues
    ///  scanning behind it.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(len) = self.body_len {
                if self.buf.len() < len {
                    return Ok(None);
                }
                self.body_len = None;
                return Ok(Some(self.buf.split_to(len).freeze()));
            }

            match self.buf.iter().position(|&b| b == FRAME_MARK) {
                None => {
                    if !self.buf.is_empty() {
                        debug!("discarding {} bytes without a frame mark", self.buf.len());
                        self.buf.clear();
                    }
                    return Ok(None);
                }
                Some(0) => {}
                Some(pos) => {
                    debug!("skipping {} bytes before frame mark", pos);
                    self.buf.advance(pos);
                }
            }

            let header = &self.buf[1..];
            let digits_len = match header.iter().position(|&b| b == LENGTH_DELIMITER) {
                Some(n) => n,
                None => {
                    // incomplete header: fail early if what we have so far can not become a length
                    if let Err(e) = Self::check_digits(header) {
                        self.buf.advance(1);
                        return Err(e);
                    }
                    return Ok(None);
                }
            };

            let parsed = Self::check_digits(&header[..digits_len])
                .and_then(|_| Self::parse_len(&header[..digits_len]));
            let len = match parsed {
                Ok(len) => len,
                Err(e) => {
                    self.buf.advance(1);
                    return Err(e);
                }
            };
            self.buf.advance(digits_len + 2);

            if len == 0 {
                trace!("empty frame - resuming scan");
                continue;
            }
            if len > self.max_frame_len {
                // the body is still consumed as-is, mark bytes included
                let skipped = len.min(self.buf.len());
                self.buf.advance(skipped);
                self.skip = len - skipped;
                anyhow::bail!("frame length {} exceeds the maximum of {}", len, self.max_frame_len);
            }
            self.body_len = Some(len);
        }
    }

    fn check_digits(digits: &[u8]) -> anyhow::Result<()> {
        if digits.len() > MAX_LENGTH_DIGITS {
            anyhow::bail!("frame length has more than {} digits", MAX_LENGTH_DIGITS);
        }
        if let Some(b) = digits.iter().find(|b| !b.is_ascii_digit()) {
            anyhow::bail!("non-numeric character {:?} in frame length", *b as char);
        }
        Ok(())
    }

    fn parse_len(digits: &[u8]) -> anyhow::Result<usize> {
        if digits.is_empty() {
            anyhow::bail!("frame without length digits");
        }
        // digits are checked to be ASCII, so this is valid UTF-8
        let s = std::str::from_utf8(digits)?;
        Ok(s.parse()?)
    }
}
