use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_byte_string(buf)?;
    let s = String::from_utf8(raw)?;
    Ok(s)
}

pub fn put_byte_string(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

/// reads a varint length prefix and that many bytes, checking the length against what is
///  actually left in the buffer *before* allocating
pub fn try_get_byte_string(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        anyhow::bail!("declared length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}
