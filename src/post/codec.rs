use std::collections::BTreeMap;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
#[cfg(test)] use mockall::automock;

use crate::post::message::{Address, EncryptionType, Message, Metadata, Source};
use crate::util::buf::{put_byte_string, put_string, try_get_byte_string, try_get_string};


/// Turns messages into the bytes that are encrypted and sent, and back
#[cfg_attr(test, automock)]
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Bytes;

    fn decode(&self, buf: &[u8]) -> anyhow::Result<Message>;
}

const FORMAT_VERSION: u8 = 1;

/// A compact binary message format: strings and the payload are varint length prefixed,
///  lists and maps have a varint element count.
pub struct BinaryCodec;

impl BinaryCodec {
    fn put_address(buf: &mut impl BufMut, address: &Address) {
        buf.put_usize_varint(address.len());
        for hop in address {
            put_string(buf, hop);
        }
    }

    fn try_get_address(buf: &mut impl Buf) -> anyhow::Result<Address> {
        let len = buf.try_get_usize_varint()?;
        // every hop takes at least one byte
        if len > buf.remaining() {
            bail!("address with {} hops exceeds remaining buffer", len);
        }
        let mut result = Address::with_capacity(len);
        for _ in 0..len {
            result.push_back(try_get_string(buf)?);
        }
        Ok(result)
    }

    fn try_get_extra(buf: &mut impl Buf) -> anyhow::Result<BTreeMap<String, String>> {
        let len = buf.try_get_usize_varint()?;
        let mut result = BTreeMap::new();
        for _ in 0..len {
            let key = try_get_string(buf)?;
            let value = try_get_string(buf)?;
            result.insert(key, value);
        }
        Ok(result)
    }
}

impl MessageCodec for BinaryCodec {
    fn encode(&self, message: &Message) -> Bytes {
        let meta = &message.meta;

        let mut buf = BytesMut::new();
        buf.put_u8(FORMAT_VERSION);
        put_string(&mut buf, &meta.kind);
        Self::put_address(&mut buf, &meta.to);
        Self::put_address(&mut buf, &meta.from);
        buf.put_usize_varint(meta.extra.len());
        for (key, value) in &meta.extra {
            put_string(&mut buf, key);
            put_string(&mut buf, value);
        }
        buf.put_u8(meta.encryption.into());
        buf.put_u8(meta.source.into());
        put_byte_string(&mut buf, &message.data);
        buf.freeze()
    }

    fn decode(&self, mut buf: &[u8]) -> anyhow::Result<Message> {
        let version = buf.try_get_u8()?;
        if version != FORMAT_VERSION {
            bail!("unsupported message format version {}", version);
        }

        let kind = try_get_string(&mut buf)?;
        let to = Self::try_get_address(&mut buf)?;
        let from = Self::try_get_address(&mut buf)?;
        let extra = Self::try_get_extra(&mut buf)?;
        let encryption = EncryptionType::try_from(buf.try_get_u8()?)?;
        let source = Source::try_from(buf.try_get_u8()?)?;
        let data = Bytes::from(try_get_byte_string(&mut buf)?);

        if buf.has_remaining() {
            bail!("{} trailing bytes after message", buf.remaining());
        }

        Ok(Message {
            meta: Metadata {
                kind,
                to,
                from,
                extra,
                encryption,
                source,
            },
            data,
        })
    }
}
