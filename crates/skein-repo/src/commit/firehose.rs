//! Firehose commit events
//!
//! A commit event announces one new repository commit. It carries the
//! structured list of record operations plus a CAR-framed `blocks` payload
//! holding the commit block, the MST nodes that changed and the new record
//! blocks. Events travel as frames: a DAG-CBOR header `{op, t}` immediately
//! followed by the DAG-CBOR body.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use skein_common::cbor::{self, DagCborValue};
use skein_common::types::crypto::PublicKey;
use skein_common::{Cid, Did, Tid};
use smol_str::SmolStr;

use super::Commit;
use crate::car::{CarLimits, parse_car_bytes};
use crate::error::{CommitError, FirehoseError, RepoError, Result};
use crate::mst::{Mst, WriteOp};
use crate::storage::{BlockStore, LayeredBlockStore, MemoryBlockStore};

/// Frame type of a commit event body
pub const COMMIT_FRAME_TYPE: &str = "#commit";

/// What an operation did to its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepoAction {
    /// Record created
    Create,
    /// Record replaced
    Update,
    /// Record removed
    Delete,
}

impl RepoAction {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoAction::Create => "create",
            RepoAction::Update => "update",
            RepoAction::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(RepoAction::Create),
            "update" => Some(RepoAction::Update),
            "delete" => Some(RepoAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RepoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A repository operation (mutation of a single record)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// Operation type
    pub action: RepoAction,

    /// Collection/rkey path (e.g., "app.bsky.feed.post/abc123")
    pub path: SmolStr,

    /// For creates and updates, the new record CID. For deletions, None (null).
    pub cid: Option<Cid>,

    /// For updates and deletes, the previous record CID
    pub prev: Option<Cid>,
}

impl RepoOp {
    /// Encode as a DAG-CBOR map
    pub fn to_value(&self) -> DagCborValue {
        let mut entries: Vec<(&str, DagCborValue)> = vec![
            ("action", self.action.as_str().into()),
            ("path", self.path.clone().into()),
            ("cid", self.cid.into()),
        ];
        if let Some(prev) = self.prev {
            entries.push(("prev", prev.into()));
        }
        DagCborValue::map(entries)
    }

    /// Decode from a DAG-CBOR map
    pub fn from_value(value: &DagCborValue) -> std::result::Result<Self, CommitError> {
        let action = value
            .get("action")
            .and_then(DagCborValue::as_str)
            .and_then(RepoAction::parse)
            .ok_or_else(|| CommitError::Malformed("op action missing or unknown".into()))?;
        let path = value
            .get("path")
            .and_then(DagCborValue::as_str)
            .ok_or_else(|| CommitError::Malformed("op path missing".into()))?;
        Ok(Self {
            action,
            path: SmolStr::new(path),
            cid: optional_link(value, "cid")?,
            prev: optional_link(value, "prev")?,
        })
    }

    /// As a tree write, with `prev` checked where present
    pub fn to_write_op(&self) -> std::result::Result<WriteOp, CommitError> {
        let missing_cid = || CommitError::Malformed(format!("{} of {} has no cid", self.action, self.path));
        Ok(match self.action {
            RepoAction::Create => WriteOp::Create {
                key: self.path.clone(),
                cid: self.cid.ok_or_else(missing_cid)?,
            },
            RepoAction::Update => WriteOp::Update {
                key: self.path.clone(),
                cid: self.cid.ok_or_else(missing_cid)?,
                prev: self.prev,
            },
            RepoAction::Delete => WriteOp::Delete {
                key: self.path.clone(),
                prev: self.prev,
            },
        })
    }
}

/// Firehose commit message (sync v1.0 and v1.1)
///
/// **Sync v1.0 vs v1.1:**
/// - v1.0: `prev_data` is None, consumers must have the previous repository state to validate
/// - v1.1: `prev_data` names the previous MST root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseCommit {
    /// The repo this event comes from
    pub repo: Did,

    /// The rev of the emitted commit
    pub rev: Tid,

    /// The stream sequence number of this message
    pub seq: i64,

    /// The rev of the last emitted commit from this repo (if any)
    pub since: Option<Tid>,

    /// When this message was originally broadcast
    pub time: DateTime<Utc>,

    /// Repo commit object CID; also the first root of `blocks`
    pub commit: Cid,

    /// CAR bytes with the blocks changed by this commit
    pub blocks: Bytes,

    /// Operations in this commit
    pub ops: Vec<RepoOp>,

    /// Previous MST root CID (sync v1.1)
    pub prev_data: Option<Cid>,

    /// Blob CIDs referenced in this commit
    pub blobs: Vec<Cid>,

    /// Set when ops or blocks were over the limits and were left out
    pub too_big: bool,

    /// DEPRECATED: Unused
    pub rebase: bool,
}

impl FirehoseCommit {
    /// Encode as a DAG-CBOR map
    pub fn to_value(&self) -> DagCborValue {
        let mut entries: Vec<(&str, DagCborValue)> = vec![
            ("seq", DagCborValue::integer(self.seq)),
            ("rebase", self.rebase.into()),
            ("tooBig", self.too_big.into()),
            ("repo", self.repo.as_str().into()),
            ("commit", self.commit.into()),
            ("rev", self.rev.as_str().into()),
            (
                "since",
                match &self.since {
                    Some(since) => since.as_str().into(),
                    None => DagCborValue::Null,
                },
            ),
            ("blocks", self.blocks.clone().into()),
            (
                "ops",
                DagCborValue::Array(self.ops.iter().map(RepoOp::to_value).collect()),
            ),
            (
                "blobs",
                DagCborValue::Array(self.blobs.iter().map(|cid| (*cid).into()).collect()),
            ),
            (
                "time",
                self.time.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
            ),
        ];
        if let Some(prev_data) = self.prev_data {
            entries.push(("prevData", prev_data.into()));
        }
        DagCborValue::map(entries)
    }

    /// Decode from a DAG-CBOR map
    pub fn from_value(value: &DagCborValue) -> std::result::Result<Self, CommitError> {
        let text = |name: &str| {
            value
                .get(name)
                .and_then(DagCborValue::as_str)
                .ok_or_else(|| CommitError::Malformed(format!("{} missing or not text", name)))
        };
        let flag = |name: &str| value.get(name).and_then(DagCborValue::as_bool).unwrap_or(false);

        let repo = Did::new(text("repo")?).map_err(|e| CommitError::Malformed(e.to_string()))?;
        let rev = Tid::new(text("rev")?).map_err(|e| CommitError::Malformed(e.to_string()))?;
        let since = match value.get("since") {
            None | Some(DagCborValue::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| CommitError::Malformed("since is not text".into()))
                    .and_then(|s| Tid::new(s).map_err(|e| CommitError::Malformed(e.to_string())))?,
            ),
        };
        let seq = value
            .get("seq")
            .and_then(DagCborValue::as_i64)
            .ok_or_else(|| CommitError::Malformed("seq missing".into()))?;
        let time = DateTime::parse_from_rfc3339(text("time")?)
            .map_err(|e| CommitError::Malformed(format!("time: {}", e)))?
            .with_timezone(&Utc);
        let commit = optional_link(value, "commit")?
            .ok_or_else(|| CommitError::Malformed("commit missing".into()))?;
        let blocks = value
            .get("blocks")
            .and_then(DagCborValue::as_bytes)
            .cloned()
            .ok_or_else(|| CommitError::Malformed("blocks missing".into()))?;
        let ops = value
            .get("ops")
            .and_then(DagCborValue::as_array)
            .ok_or_else(|| CommitError::Malformed("ops missing".into()))?
            .iter()
            .map(RepoOp::from_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let blobs = value
            .get("blobs")
            .and_then(DagCborValue::as_array)
            .unwrap_or_default()
            .iter()
            .map(|v| {
                v.as_link()
                    .copied()
                    .ok_or_else(|| CommitError::Malformed("blob is not a link".into()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            repo,
            rev,
            seq,
            since,
            time,
            commit,
            blocks,
            ops,
            prev_data: optional_link(value, "prevData")?,
            blobs,
            too_big: flag("tooBig"),
            rebase: flag("rebase"),
        })
    }

    /// Encode as a `#commit` frame
    pub fn to_frame(&self) -> Vec<u8> {
        encode_frame(&FrameHeader::message(COMMIT_FRAME_TYPE), &self.to_value())
    }

    /// Validate this commit against the consumer's copy of the repository
    ///
    /// The blocks are staged in memory over `prev_storage`, which is never
    /// written to. `prev_root` is the consumer's current MST root; when
    /// absent, `prevData` from the event is used, and with neither the
    /// previous tree is empty.
    ///
    /// Checks, in order: the CAR root is the commit, the commit block is
    /// present, DID and rev agree with the event, the signature verifies
    /// against `pubkey`, created and updated records are present, and
    /// replaying the ops over the previous tree reproduces `commit.data`.
    /// The embedded blocks are framed under `limits`, normally the consumer's
    /// [`RepoConfig::car`](crate::config::RepoConfig).
    ///
    /// Returns the new MST root CID on success.
    #[tracing::instrument(skip_all, fields(repo = %self.repo, rev = %self.rev, seq = self.seq))]
    pub async fn validate<S: BlockStore + Sync + Send + 'static>(
        &self,
        prev_root: Option<Cid>,
        prev_storage: Arc<S>,
        pubkey: &PublicKey,
        limits: &CarLimits,
    ) -> Result<Cid> {
        let parsed = parse_car_bytes(&self.blocks, limits)?;
        if parsed.root != self.commit {
            return Err(FirehoseError::CommitCidMismatch {
                root: parsed.root.to_string(),
                commit: self.commit.to_string(),
            }
            .into());
        }

        let commit_bytes = parsed
            .blocks
            .get(&self.commit)
            .ok_or(FirehoseError::CommitNotFound)?;
        let commit = Commit::from_cbor(commit_bytes)?;

        if commit.did != self.repo {
            return Err(FirehoseError::DidMismatch {
                commit_did: commit.did.to_string(),
                event_did: self.repo.to_string(),
            }
            .into());
        }
        if commit.rev != self.rev {
            return Err(FirehoseError::RevMismatch {
                commit_rev: commit.rev.to_string(),
                event_rev: self.rev.to_string(),
            }
            .into());
        }
        commit
            .verify(pubkey)
            .map_err(|source| FirehoseError::SignatureVerificationFailed { source })?;

        let mut writes = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            if let Some(cid) = op.cid {
                if !parsed.blocks.contains_key(&cid) {
                    return Err(FirehoseError::MissingRecordBlock {
                        cid: cid.to_string(),
                    }
                    .into());
                }
            }
            writes.push(op.to_write_op()?);
        }

        let staging = MemoryBlockStore::new_from_blocks(parsed.blocks);
        let layered = Arc::new(LayeredBlockStore::new(staging, prev_storage));
        let prev = match prev_root.or(self.prev_data) {
            Some(root) => Mst::load(layered, root),
            None => Mst::new(layered),
        };
        let computed = prev.apply_ops(&writes).await?.root();

        if computed != commit.data {
            return Err(FirehoseError::DataMismatch {
                computed: computed.to_string(),
                claimed: commit.data.to_string(),
            }
            .into());
        }

        tracing::debug!(ops = self.ops.len(), data = %commit.data, "validated firehose commit");
        Ok(commit.data)
    }
}

fn optional_link(value: &DagCborValue, name: &str) -> std::result::Result<Option<Cid>, CommitError> {
    match value.get(name) {
        None | Some(DagCborValue::Null) => Ok(None),
        Some(DagCborValue::Link(cid)) => Ok(Some(*cid)),
        Some(other) => Err(CommitError::Malformed(format!(
            "{} is {}, expected link",
            name,
            other.kind_name()
        ))),
    }
}

/// Event stream frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// 1 for a message, -1 for an error
    pub op: i64,
    /// Message type such as `#commit`; absent on errors
    pub t: Option<SmolStr>,
}

impl FrameHeader {
    /// Header of a regular message
    pub fn message(t: &str) -> Self {
        Self {
            op: 1,
            t: Some(SmolStr::new(t)),
        }
    }

    /// Header of an error frame
    pub fn error() -> Self {
        Self { op: -1, t: None }
    }

    fn to_value(&self) -> DagCborValue {
        let mut entries: Vec<(&str, DagCborValue)> = vec![("op", DagCborValue::integer(self.op))];
        if let Some(t) = &self.t {
            entries.push(("t", t.clone().into()));
        }
        DagCborValue::map(entries)
    }
}

/// A decoded event stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `#commit` message
    Commit(Box<FirehoseCommit>),
    /// Error frame
    Error {
        /// Error name
        error: SmolStr,
        /// Human readable detail
        message: Option<SmolStr>,
    },
    /// Some other message type, passed through undecoded
    Unknown {
        /// Message type
        t: Option<SmolStr>,
        /// Raw body
        body: DagCborValue,
    },
}

/// Concatenate a header and a body into one frame
pub fn encode_frame(header: &FrameHeader, body: &DagCborValue) -> Vec<u8> {
    let mut out = cbor::encode(&header.to_value());
    cbor::encode_into(body, &mut out);
    out
}

/// Encode an error frame
pub fn encode_error_frame(error: &str, message: Option<&str>) -> Vec<u8> {
    let mut entries: Vec<(&str, DagCborValue)> = vec![("error", error.into())];
    if let Some(message) = message {
        entries.push(("message", message.into()));
    }
    encode_frame(&FrameHeader::error(), &DagCborValue::map(entries))
}

/// Split a frame into its header and body and decode the body
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let (header, used) = cbor::decode_prefix(bytes)?;
    let body = cbor::decode(&bytes[used..])?;

    let op = header
        .get("op")
        .and_then(DagCborValue::as_i64)
        .ok_or_else(|| RepoError::from(CommitError::Malformed("frame header has no op".into())))?;
    let t = header.get("t").and_then(DagCborValue::as_str).map(SmolStr::new);

    match (op, t.as_deref()) {
        (-1, _) => {
            let error = body
                .get("error")
                .and_then(DagCborValue::as_str)
                .ok_or_else(|| RepoError::from(CommitError::Malformed("error frame has no error".into())))?;
            Ok(Frame::Error {
                error: SmolStr::new(error),
                message: body.get("message").and_then(DagCborValue::as_str).map(SmolStr::new),
            })
        }
        (1, Some(COMMIT_FRAME_TYPE)) => Ok(Frame::Commit(Box::new(FirehoseCommit::from_value(&body)?))),
        _ => Ok(Frame::Unknown { t, body }),
    }
}
