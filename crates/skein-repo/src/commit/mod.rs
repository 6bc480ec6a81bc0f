//! Signed repository commits
//!
//! A commit binds a DID to an MST root at a revision and carries a signature
//! over its own encoding with the `sig` field left out. The commit's CID is
//! computed over the fully signed encoding.

pub mod firehose;

use bytes::Bytes;
use skein_common::cbor::{self, DagCborValue};
use skein_common::types::crypto::{KeyCodec, PublicKey};
use skein_common::{Cid, Did, Tid};

use crate::error::{BoxError, CommitError, Result};

/// Commit version written by this crate
pub const COMMIT_VERSION: u64 = 3;

/// Repository commit object
///
/// **Version compatibility**: v2 and v3 commits share a shape. v3 always
/// carries `prev` (possibly null); v2 commits may omit it. Both decode here,
/// and re-encoding a decoded commit reproduces its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Commit version (2 or 3)
    pub version: u64,

    /// MST root CID
    pub data: Cid,

    /// Revision TID
    pub rev: Tid,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<Cid>,

    /// Signature bytes, empty until signed
    pub sig: Bytes,
}

impl Commit {
    /// Create new unsigned commit (version = 3, sig empty)
    pub fn new_unsigned(did: Did, data: Cid, rev: Tid, prev: Option<Cid>) -> Self {
        Self {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig: Bytes::new(),
        }
    }

    /// Sign this commit.
    ///
    /// The signer sees the unsigned encoding. Its failure surfaces as
    /// [`CommitError::SigningFailed`] and the commit is dropped.
    pub fn sign(mut self, key: &impl SigningKey) -> Result<Self> {
        let unsigned = self.unsigned_bytes();
        self.sig = key.sign_bytes(&unsigned)?;
        tracing::debug!(did = %self.did, rev = %self.rev, "signed commit");
        Ok(self)
    }

    fn to_value(&self, with_sig: bool) -> DagCborValue {
        let mut entries: Vec<(&str, DagCborValue)> = vec![
            ("did", self.did.as_str().into()),
            ("version", self.version.into()),
            ("data", self.data.into()),
            ("rev", self.rev.as_str().into()),
        ];
        // v2 commits without a prev leave the key out
        if self.version >= COMMIT_VERSION || self.prev.is_some() {
            entries.push(("prev", self.prev.into()));
        }
        if with_sig {
            entries.push(("sig", self.sig.clone().into()));
        }
        DagCborValue::map(entries)
    }

    /// The bytes that get signed: the commit without its `sig` field
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        cbor::encode(&self.to_value(false))
    }

    /// Serialize to DAG-CBOR, signature included
    pub fn to_cbor(&self) -> Vec<u8> {
        cbor::encode(&self.to_value(true))
    }

    /// Deserialize from DAG-CBOR
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let value = cbor::decode(data)?;
        Ok(Self::from_value(&value)?)
    }

    fn from_value(value: &DagCborValue) -> std::result::Result<Self, CommitError> {
        let field = |name: &str| {
            value
                .get(name)
                .ok_or_else(|| CommitError::Malformed(format!("missing field {}", name)))
        };

        let version = field("version")?
            .as_u64()
            .ok_or_else(|| CommitError::Malformed("version is not an integer".into()))?;
        if version != 2 && version != 3 {
            return Err(CommitError::InvalidVersion(version));
        }

        let did = field("did")?
            .as_str()
            .ok_or_else(|| CommitError::Malformed("did is not text".into()))?;
        let did = Did::new(did).map_err(|e| CommitError::Malformed(e.to_string()))?;

        let data = *field("data")?
            .as_link()
            .ok_or_else(|| CommitError::Malformed("data is not a link".into()))?;

        let rev = field("rev")?
            .as_str()
            .ok_or_else(|| CommitError::Malformed("rev is not text".into()))?;
        let rev = Tid::new(rev).map_err(|e| CommitError::Malformed(e.to_string()))?;

        let prev = match value.get("prev") {
            None if version >= COMMIT_VERSION => {
                return Err(CommitError::Malformed("missing field prev".into()));
            }
            None | Some(DagCborValue::Null) => None,
            Some(DagCborValue::Link(cid)) => Some(*cid),
            Some(other) => {
                return Err(CommitError::Malformed(format!(
                    "prev is {}, expected link or null",
                    other.kind_name()
                )));
            }
        };

        let sig = field("sig")?
            .as_bytes()
            .cloned()
            .ok_or_else(|| CommitError::Malformed("sig is not bytes".into()))?;

        Ok(Self {
            did,
            version,
            data,
            rev,
            prev,
            sig,
        })
    }

    /// CID of the signed encoding
    pub fn cid(&self) -> Cid {
        Cid::for_dag_cbor_bytes(&self.to_cbor())
    }

    /// Verify the signature against a public key from a DID document.
    ///
    /// The key type is inferred from the PublicKey codec. High-S ECDSA
    /// signatures are rejected.
    pub fn verify(&self, pubkey: &PublicKey) -> std::result::Result<(), CommitError> {
        let unsigned = self.unsigned_bytes();
        let signature = self.sig.as_ref();

        match pubkey.codec {
            KeyCodec::Secp256k1 => {
                use k256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let pk = pubkey
                    .to_k256()
                    .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
                let sig = Signature::from_slice(signature)
                    .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                if sig.normalize_s().is_some() {
                    return Err(CommitError::InvalidSignature("high-S signature".into()));
                }
                VerifyingKey::from(&pk)
                    .verify(&unsigned, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)?;
            }
            KeyCodec::P256 => {
                use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let pk = pubkey
                    .to_p256()
                    .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
                let sig = Signature::from_slice(signature)
                    .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                if sig.normalize_s().is_some() {
                    return Err(CommitError::InvalidSignature("high-S signature".into()));
                }
                VerifyingKey::from(&pk)
                    .verify(&unsigned, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)?;
            }
            KeyCodec::Unknown(code) => {
                return Err(CommitError::UnsupportedKeyType(code));
            }
        }

        Ok(())
    }
}

/// Something that can sign commits.
///
/// Implemented for `k256::ecdsa::SigningKey`, `p256::ecdsa::SigningKey` and
/// [`FnSigner`], which wraps an external signing function.
pub trait SigningKey {
    /// Sign the given data and return signature as Bytes
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// Public half, for verification
    fn public_key(&self) -> PublicKey;
}

impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = Signer::<k256::ecdsa::Signature>::try_sign(self, data)
            .map_err(|e| CommitError::SigningFailed(Box::new(e)))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey {
        PublicKey {
            codec: KeyCodec::Secp256k1,
            bytes: self.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
        }
    }
}

impl SigningKey for p256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = Signer::<p256::ecdsa::Signature>::try_sign(self, data)
            .map_err(|e| CommitError::SigningFailed(Box::new(e)))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey {
        PublicKey {
            codec: KeyCodec::P256,
            bytes: self.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
        }
    }
}

/// Signing through a caller-supplied function.
///
/// For keys held elsewhere (an HSM, a remote signer). The function receives
/// the unsigned commit bytes and returns raw signature bytes.
///
/// ```rust,ignore
/// let signer = FnSigner::new(public_key, |bytes: &[u8]| remote.sign(bytes));
/// let commit = commit.sign(&signer)?;
/// ```
pub struct FnSigner<F> {
    public_key: PublicKey,
    sign: F,
}

impl<F, E> FnSigner<F>
where
    F: Fn(&[u8]) -> std::result::Result<Vec<u8>, E>,
    E: Into<BoxError>,
{
    /// Wrap a signing function and the public key it signs for
    pub fn new(public_key: PublicKey, sign: F) -> Self {
        Self { public_key, sign }
    }
}

impl<F, E> SigningKey for FnSigner<F>
where
    F: Fn(&[u8]) -> std::result::Result<Vec<u8>, E>,
    E: Into<BoxError>,
{
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        match (self.sign)(data) {
            Ok(sig) => Ok(Bytes::from(sig)),
            Err(e) => {
                let e: BoxError = e.into();
                tracing::warn!(error = %e, "external signer failed");
                Err(CommitError::SigningFailed(e).into())
            }
        }
    }

    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }
}

impl<F> std::fmt::Debug for FnSigner<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSigner")
            .field("public_key", &self.public_key.did_key())
            .finish_non_exhaustive()
    }
}
