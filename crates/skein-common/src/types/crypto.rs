//! Multikey public keys for commit signature verification.
//!
//! atproto publishes signing keys as Multikey strings: a multicodec varint
//! (`0xE7` secp256k1, `0x1200` P-256) followed by the compressed SEC1 point,
//! base58btc encoded. `did:key` identifiers are the same string behind a
//! `did:key:` prefix.

use crate::varint;

/// Known multicodec key codecs for Multikey public keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCodec {
    /// Secp256k1
    Secp256k1,
    /// P256
    P256,
    /// Unknown codec
    Unknown(u64),
}

impl KeyCodec {
    /// Multicodec number for this key type
    pub fn code(self) -> u64 {
        match self {
            KeyCodec::Secp256k1 => 0xE7,
            KeyCodec::P256 => 0x1200,
            KeyCodec::Unknown(c) => c,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0xE7 => KeyCodec::Secp256k1,
            0x1200 => KeyCodec::P256,
            other => KeyCodec::Unknown(other),
        }
    }
}

/// Public key decoded from a Multikey `publicKeyMultibase` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Codec used to encode the public key
    pub codec: KeyCodec,
    /// SEC1 encoded point
    pub bytes: Vec<u8>,
}

/// Errors from decoding or converting Multikey values
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CryptoError {
    /// Multibase decode error
    #[error("failed to decode multibase")]
    MultibaseDecode,
    /// Multicodec decode error
    #[error("failed to decode multicodec varint")]
    MulticodecDecode,
    /// Unsupported key codec error
    #[error("unsupported key codec: 0x{0:x}")]
    UnsupportedCodec(u64),
    /// Invalid key length error
    #[error("invalid key length: expected 33 or 65, got {0}")]
    InvalidLength(usize),
    /// Invalid key format error
    #[error("invalid key format")]
    InvalidFormat,
    /// Conversion error
    #[error("conversion error: {0}")]
    Conversion(String),
}

impl PublicKey {
    /// Wrap SEC1 bytes of a known key type
    pub fn from_sec1(codec: KeyCodec, bytes: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let bytes = bytes.into();
        if let KeyCodec::Unknown(code) = codec {
            return Err(CryptoError::UnsupportedCodec(code));
        }
        if !(bytes.len() == 33 || bytes.len() == 65) {
            return Err(CryptoError::InvalidLength(bytes.len()));
        }
        // 0x02/0x03 compressed, 0x04 uncompressed
        match bytes.first() {
            Some(0x02 | 0x03 | 0x04) => Ok(Self { codec, bytes }),
            _ => Err(CryptoError::InvalidFormat),
        }
    }

    /// Decode a Multikey public key from a multibase-encoded string
    pub fn decode(multibase_str: &str) -> Result<Self, CryptoError> {
        let (_base, data) =
            multibase::decode(multibase_str).map_err(|_| CryptoError::MultibaseDecode)?;
        let (code, offset) =
            varint::decode_varint(&data).map_err(|_| CryptoError::MulticodecDecode)?;
        Self::from_sec1(KeyCodec::from_code(code), &data[offset..])
    }

    /// Decode a `did:key:z...` identifier
    pub fn from_did_key(did: &str) -> Result<Self, CryptoError> {
        let multikey = did
            .strip_prefix("did:key:")
            .ok_or(CryptoError::InvalidFormat)?;
        Self::decode(multikey)
    }

    /// Multikey string: base58btc over the codec varint and key bytes
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(self.bytes.len() + 3);
        varint::encode_varint(self.codec.code(), &mut buf);
        buf.extend_from_slice(&self.bytes);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// `did:key` form of this key
    pub fn did_key(&self) -> String {
        format!("did:key:{}", self.encode())
    }

    /// Convert to k256 public key (feature crypto-k256)
    #[cfg(feature = "crypto-k256")]
    pub fn to_k256(&self) -> Result<k256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::Secp256k1 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        k256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Convert to p256 public key (feature crypto-p256)
    #[cfg(feature = "crypto-p256")]
    pub fn to_p256(&self) -> Result<p256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::P256 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        p256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multikey(code: u64, key: &[u8]) -> String {
        let mut buf = Vec::new();
        varint::encode_varint(code, &mut buf);
        buf.extend_from_slice(key);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    #[test]
    fn decode_k1_compressed() {
        let mut key = [0u8; 33];
        key[0] = 0x02;
        let pk = PublicKey::decode(&multikey(0xE7, &key)).expect("decode");
        assert_eq!(pk.codec, KeyCodec::Secp256k1);
        assert_eq!(pk.bytes, key);
    }

    #[test]
    fn decode_p256_uncompressed() {
        let mut key = [0u8; 65];
        key[0] = 0x04;
        let pk = PublicKey::decode(&multikey(0x1200, &key)).expect("decode");
        assert_eq!(pk.codec, KeyCodec::P256);
        assert_eq!(pk.encode(), multikey(0x1200, &key));
    }

    #[test]
    fn reject_unknown_codec_and_bad_lengths() {
        assert_eq!(
            PublicKey::decode(&multikey(0xED, &[0u8; 32])),
            Err(CryptoError::UnsupportedCodec(0xED))
        );
        assert_eq!(
            PublicKey::decode(&multikey(0xE7, &[0x02; 10])),
            Err(CryptoError::InvalidLength(10))
        );
        let mut bad = [0u8; 33];
        bad[0] = 0x07;
        assert_eq!(
            PublicKey::decode(&multikey(0xE7, &bad)),
            Err(CryptoError::InvalidFormat)
        );
    }

    #[cfg(all(feature = "crypto-p256", feature = "crypto-k256"))]
    #[test]
    fn p256_did_key_roundtrip() {
        let sk = p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap();
        let point = sk.verifying_key().to_encoded_point(true);
        let pk = PublicKey::from_sec1(KeyCodec::P256, point.as_bytes()).unwrap();
        let did = pk.did_key();
        assert!(did.starts_with("did:key:zDn"));
        let back = PublicKey::from_did_key(&did).unwrap();
        assert_eq!(back, pk);
        assert!(back.to_p256().is_ok());
        assert!(back.to_k256().is_err());
    }

    #[cfg(feature = "crypto-k256")]
    #[test]
    fn k256_did_key_roundtrip() {
        let sk = k256::ecdsa::SigningKey::from_slice(&[9u8; 32]).unwrap();
        let point = sk.verifying_key().to_encoded_point(true);
        let pk = PublicKey::from_sec1(KeyCodec::Secp256k1, point.as_bytes()).unwrap();
        let did = pk.did_key();
        assert!(did.starts_with("did:key:zQ3s"));
        assert!(PublicKey::from_did_key(&did).unwrap().to_k256().is_ok());
    }
}
