use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;

use crate::post::message::EncryptionType;


/// Key management and encryption for peers, each peer identified by a session id string (an
///  endpoint or address string). Decrypting reports which kind of encryption the sender used.
#[cfg_attr(test, automock)]
pub trait SessionLibrary: Send + Sync {
    /// An empty result means the data could not be authenticated or decrypted
    fn decrypt(&self, session_id: &str, data: &[u8]) -> anyhow::Result<(Bytes, EncryptionType)>;

    fn encrypt_plaintext(&self, session_id: &str, data: &[u8]) -> anyhow::Result<Bytes>;
    fn encrypt_symmetric(&self, session_id: &str, data: &[u8]) -> anyhow::Result<Bytes>;
    fn encrypt_asymmetric(&self, session_id: &str, data: &[u8]) -> anyhow::Result<Bytes>;
    /// encrypts with the keys of the peer's session
    fn encrypt(&self, session_id: &str, data: &[u8]) -> anyhow::Result<Bytes>;
}

/// A [SessionLibrary] that performs no cryptography: it prefixes the data with the requested
///  encryption type, so that both sides agree on what the message claims to be.
pub struct NoEncryption;

impl NoEncryption {
    fn tag(encryption: EncryptionType, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(data.len() + 1);
        buf.put_u8(encryption.into());
        buf.put_slice(data);
        buf.freeze()
    }
}

impl SessionLibrary for NoEncryption {
    fn decrypt(&self, _session_id: &str, data: &[u8]) -> anyhow::Result<(Bytes, EncryptionType)> {
        let Some((&tag, data)) = data.split_first() else {
            bail!("missing encryption type");
        };
        let encryption = EncryptionType::try_from(tag)?;
        Ok((Bytes::copy_from_slice(data), encryption))
    }

    fn encrypt_plaintext(&self, _session_id: &str, data: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Self::tag(EncryptionType::Plaintext, data))
    }

    fn encrypt_symmetric(&self, _session_id: &str, data: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Self::tag(EncryptionType::Symmetric, data))
    }

    fn encrypt_asymmetric(&self, _session_id: &str, data: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Self::tag(EncryptionType::Asymmetric, data))
    }

    fn encrypt(&self, _session_id: &str, data: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Self::tag(EncryptionType::Session, data))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plaintext(EncryptionType::Plaintext)]
    #[case::symmetric(EncryptionType::Symmetric)]
    #[case::asymmetric(EncryptionType::Asymmetric)]
    #[case::session(EncryptionType::Session)]
    fn test_no_encryption_reports_type(#[case] encryption: EncryptionType) {
        let sessions = NoEncryption;
        let encrypted = match encryption {
            EncryptionType::Plaintext => sessions.encrypt_plaintext("peer", b"abc"),
            EncryptionType::Symmetric => sessions.encrypt_symmetric("peer", b"abc"),
            EncryptionType::Asymmetric => sessions.encrypt_asymmetric("peer", b"abc"),
            EncryptionType::Session => sessions.encrypt("peer", b"abc"),
        }.unwrap();

        assert_eq!(encrypted[0], u8::from(encryption));
        assert_eq!(sessions.decrypt("peer", &encrypted).unwrap(), (Bytes::from_static(b"abc"), encryption));
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_type(b"\x09abc")]
    fn test_no_encryption_decrypt_invalid(#[case] data: &[u8]) {
        assert!(NoEncryption.decrypt("peer", data).is_err());
    }
}
