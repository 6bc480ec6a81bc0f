//! Error types for repository operations

use skein_common::cbor::CborError;
use skein_common::types::cid::CidError;
use skein_common::types::string::StrError;
use skein_common::varint::VarIntError;
use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Storage operation failed
    Storage,
    /// Invalid MST structure
    InvalidMst,
    /// Invalid commit structure
    InvalidCommit,
    /// Invalid key format
    InvalidKey,
    /// Invalid CID
    InvalidCid,
    /// Resource not found
    NotFound,
    /// Resource already exists, or a `prev` expectation did not hold
    Conflict,
    /// Cryptographic operation failed
    Crypto,
    /// Serialization/deserialization failed
    Serialization,
    /// Data too large (exceeds protocol limits)
    TooLarge,
    /// Block framing (CAR) failed
    Car,
    /// Operation was cancelled by its consumer
    Cancelled,
    /// Invalid configuration
    Config,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    // Constructors for different error kinds

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow protocol structure")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys must match [a-zA-Z0-9._:~/-]+, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }

    /// Create an already exists error
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::Conflict, None)
            .with_context(format!("{} already exists: {}", resource, id))
    }

    /// A write's expected previous value did not match the tree
    pub fn prev_mismatch(key: &str, expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::Conflict, None).with_context(format!(
            "{}: expected prev {}, found {}",
            key, expected, actual
        ))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a too large error
    pub fn too_large(what: &str, size: usize, max: usize) -> Self {
        Self::new(RepoErrorKind::TooLarge, None)
            .with_context(format!("{} is {} bytes, max {}", what, size, max))
            .with_help("See sync v1.1 protocol limits")
    }

    /// Create a CAR error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create a cancellation error
    pub fn cancelled(what: &str) -> Self {
        Self::new(RepoErrorKind::Cancelled, None).with_context(format!("{} cancelled", what))
    }

    /// Create a configuration error
    pub fn config(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Config, Some(Box::new(source)))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<CborError> for RepoError {
    fn from(e: CborError) -> Self {
        RepoError::serialization(e)
    }
}

impl From<CidError> for RepoError {
    fn from(e: CidError) -> Self {
        RepoError::new(RepoErrorKind::InvalidCid, Some(Box::new(e)))
    }
}

impl From<StrError> for RepoError {
    fn from(e: StrError) -> Self {
        RepoError::new(RepoErrorKind::Serialization, Some(Box::new(e)))
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// Node does not have the wire shape of an MST node
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Node decoded fine but breaks the tree's layering or ordering rules
    #[error("Tree invariant violated: {0}")]
    #[diagnostic(
        code(mst::invariant),
        help("entries must sit at the layer their key hashes to, in ascending key order")
    )]
    TreeInvariantViolation(String),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
            e @ MstError::TreeInvariantViolation(_) => {
                RepoError::new(RepoErrorKind::InvalidMst, Some(Box::new(e)))
            }
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(u64),

    /// Commit block does not have the commit shape
    #[error("Malformed commit: {0}")]
    Malformed(String),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Unsupported key type
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(u64),

    /// The signing collaborator failed; nothing was committed
    #[error("Signing failed")]
    #[diagnostic(
        code(commit::signing_failed),
        help("the previous commit remains the repository head")
    )]
    SigningFailed(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::Malformed(msg) => RepoError::invalid_commit(msg),
            CommitError::InvalidSignature(msg) => {
                RepoError::new(RepoErrorKind::Crypto, Some(msg.into()))
                    .with_context("invalid signature format".to_string())
            }
            CommitError::SignatureVerificationFailed => RepoError::new(RepoErrorKind::Crypto, None)
                .with_context("signature verification failed".to_string()),
            CommitError::InvalidKey(msg) => RepoError::new(RepoErrorKind::Crypto, Some(msg.into()))
                .with_context("invalid key format".to_string()),
            CommitError::UnsupportedKeyType(code) => RepoError::new(RepoErrorKind::Crypto, None)
                .with_context(format!("unsupported key type: 0x{:x}", code)),
            e @ CommitError::SigningFailed(_) => {
                RepoError::new(RepoErrorKind::Crypto, Some(Box::new(e)))
            }
        }
    }
}

/// Block framing (CAR) errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum FramingError {
    /// Stream ended inside a length prefix
    #[error("Malformed varint length prefix")]
    #[diagnostic(code(car::malformed_varint))]
    MalformedVarInt,

    /// Stream ended inside a section
    #[error("Stream ended inside a section")]
    #[diagnostic(code(car::truncated))]
    TruncatedStream,

    /// Header length over the configured limit
    #[error("Header is {size} bytes (max {max})")]
    #[diagnostic(code(car::header_too_large))]
    HeaderTooLarge {
        /// Declared size
        size: u64,
        /// Configured limit
        max: usize,
    },

    /// Block length over the configured limit
    #[error("Block is {size} bytes (max {max})")]
    #[diagnostic(code(car::block_too_large))]
    BlockTooLarge {
        /// Declared size
        size: u64,
        /// Configured limit
        max: usize,
    },

    /// Header does not decode to `{version: 1, roots: [...]}`
    #[error("Invalid header: {0}")]
    #[diagnostic(code(car::invalid_header))]
    InvalidHeader(String),

    /// Block section is unusable
    #[error("Invalid block: {0}")]
    #[diagnostic(code(car::invalid_block))]
    InvalidBlock(String),

    /// The consumer went away
    #[error("Write cancelled")]
    #[diagnostic(code(car::cancelled))]
    Cancelled,

    /// Underlying reader or writer failed
    #[error("I/O error")]
    #[diagnostic(code(car::io))]
    Io(#[source] std::io::Error),
}

impl From<VarIntError> for FramingError {
    fn from(e: VarIntError) -> Self {
        match e {
            VarIntError::MalformedVarInt | VarIntError::Overflow => FramingError::MalformedVarInt,
            VarIntError::Io(io) => FramingError::Io(io),
        }
    }
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FramingError::TruncatedStream,
            _ => FramingError::Io(e),
        }
    }
}

impl From<FramingError> for RepoError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::HeaderTooLarge { size, max } => {
                RepoError::too_large("CAR header", size as usize, max)
            }
            FramingError::BlockTooLarge { size, max } => {
                RepoError::too_large("CAR block", size as usize, max)
            }
            FramingError::Cancelled => RepoError::cancelled("CAR write"),
            FramingError::Io(io) => RepoError::io(io),
            other => RepoError::car(other),
        }
    }
}

/// Diff-specific errors
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// Too many operations
    #[error("Too many operations: {count} (max {max})")]
    TooManyOps {
        /// Actual operation count
        count: usize,
        /// Maximum allowed operations
        max: usize,
    },

    /// Diff too large
    #[error("Diff too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Maximum size
        max: usize,
    },
}

impl From<DiffError> for RepoError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::TooManyOps { count, max } => {
                RepoError::too_large("diff operation count", count, max)
                    .with_help("split the writes across several commits")
            }
            DiffError::TooLarge { size, max } => RepoError::too_large("diff size", size, max),
        }
    }
}

/// Firehose commit validation errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum FirehoseError {
    /// CAR root does not match the event's commit field
    #[error("CAR root {root} does not match commit {commit}")]
    #[diagnostic(code(firehose::root_mismatch))]
    CommitCidMismatch {
        /// First CAR root
        root: String,
        /// `commit` field of the event
        commit: String,
    },

    /// Commit block not found in CAR
    #[error("Commit block not found in CAR")]
    #[diagnostic(
        code(firehose::commit_not_found),
        help("The CAR root CID must point to a valid commit block")
    )]
    CommitNotFound,

    /// DID mismatch between commit and event
    #[error("DID mismatch: commit has {commit_did}, event has {event_did}")]
    #[diagnostic(code(firehose::did_mismatch))]
    DidMismatch {
        /// DID in the commit
        commit_did: String,
        /// DID on the event
        event_did: String,
    },

    /// Rev mismatch between commit and event
    #[error("Rev mismatch: commit has {commit_rev}, event has {event_rev}")]
    #[diagnostic(code(firehose::rev_mismatch))]
    RevMismatch {
        /// Rev in the commit
        commit_rev: String,
        /// Rev on the event
        event_rev: String,
    },

    /// Signature verification failed
    #[error("Signature verification failed")]
    #[diagnostic(
        code(firehose::signature_failed),
        help("The commit signature must be valid for the provided public key")
    )]
    SignatureVerificationFailed {
        /// Underlying crypto error
        #[source]
        source: CommitError,
    },

    /// Record block for a create/update missing from the CAR
    #[error("Record block missing from CAR: {cid}")]
    #[diagnostic(code(firehose::missing_record))]
    MissingRecordBlock {
        /// The missing CID
        cid: String,
    },

    /// Replaying ops did not reproduce the commit's data root
    #[error("MST root mismatch: ops produce {computed}, commit claims {claimed}")]
    #[diagnostic(
        code(firehose::data_mismatch),
        help("the ops list must describe exactly the change between prevData and data")
    )]
    DataMismatch {
        /// Root computed from ops
        computed: String,
        /// Root in the commit
        claimed: String,
    },
}

impl From<FirehoseError> for RepoError {
    fn from(e: FirehoseError) -> Self {
        let kind = match &e {
            FirehoseError::CommitCidMismatch { .. } => RepoErrorKind::Car,
            FirehoseError::CommitNotFound | FirehoseError::MissingRecordBlock { .. } => {
                RepoErrorKind::NotFound
            }
            FirehoseError::SignatureVerificationFailed { .. } => RepoErrorKind::Crypto,
            FirehoseError::DidMismatch { .. }
            | FirehoseError::RevMismatch { .. }
            | FirehoseError::DataMismatch { .. } => RepoErrorKind::InvalidCommit,
        };
        RepoError::new(kind, Some(Box::new(e)))
    }
}
