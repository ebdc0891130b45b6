use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// A route as a list of hops, the front being the next hop
pub type Address = VecDeque<String>;

/// keys of the provenance entries the master post office adds to [Metadata::extra]
pub const EXTRA_FROM_PROTOCOL: &str = "from_protocol";
pub const EXTRA_FROM_IP: &str = "from_ip";
pub const EXTRA_FROM_PORT: &str = "from_port";

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum EncryptionType {
    Plaintext = 0,
    Symmetric = 1,
    Asymmetric = 2,
    /// encrypted with keys negotiated for the peer's session
    Session = 3,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Source {
    Local = 0,
    Remote = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Metadata {
    pub kind: String,
    pub to: Address,
    pub from: Address,
    pub extra: BTreeMap<String, String>,
    pub encryption: EncryptionType,
    pub source: Source,
}

/// An application message: routing metadata plus an opaque payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub meta: Metadata,
    pub data: Bytes,
}

impl Message {
    pub fn new(kind: impl Into<String>, to: Address, from: Address, data: Bytes) -> Message {
        Message {
            meta: Metadata {
                kind: kind.into(),
                to,
                from,
                extra: BTreeMap::new(),
                encryption: EncryptionType::Plaintext,
                source: Source::Local,
            },
            data,
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionType) -> Message {
        self.meta.encryption = encryption;
        self
    }
}

/// convenience for building an [Address] from its hops
pub fn address<'a>(hops: impl IntoIterator<Item = &'a str>) -> Address {
    hops.into_iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plaintext(0, EncryptionType::Plaintext)]
    #[case::symmetric(1, EncryptionType::Symmetric)]
    #[case::asymmetric(2, EncryptionType::Asymmetric)]
    #[case::session(3, EncryptionType::Session)]
    fn test_encryption_type_ids(#[case] id: u8, #[case] encryption: EncryptionType) {
        assert_eq!(u8::from(encryption), id);
        assert_eq!(EncryptionType::try_from(id).unwrap(), encryption);
    }

    #[test]
    fn test_encryption_type_invalid_id() {
        assert!(EncryptionType::try_from(4).is_err());
    }

    #[test]
    fn test_new_message() {
        let message = Message::new("chat", address(["master", "app"]), address(["me"]), Bytes::from_static(b"hi"))
            .with_encryption(EncryptionType::Session);
        assert_eq!(message.meta.to.front().map(String::as_str), Some("master"));
        assert_eq!(message.meta.encryption, EncryptionType::Session);
        assert_eq!(message.meta.source, Source::Local);
        assert!(message.meta.extra.is_empty());
    }
}
