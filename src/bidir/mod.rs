//! Bidirectional reconciliation against a peer.
//!
//! The unidirectional pipeline pushes local changes out; this subtree adds
//! the reverse direction: a per-remote metadata store outside the watched
//! tree, a conflict detector and resolver over three-way file metadata, a
//! peer reconciler driving an external two-way synchronizer, and a
//! coordinator merging the local and remote change streams.

pub mod coordinator;
pub mod detect;
pub mod metadata;
pub mod reconciler;
pub mod remote;
pub mod resolve;

use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::events::EventKind;
use detect::FileMetadata;

/// Which side of the pair an event or file version belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Coarse change kind used on the bidirectional path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Move,
}

impl From<&EventKind> for ChangeKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::CreateFile | EventKind::CreateDir => ChangeKind::Create,
            EventKind::CloseWrite | EventKind::Modify | EventKind::Attrib => ChangeKind::Modify,
            EventKind::DeleteFile | EventKind::DeleteDir => ChangeKind::Delete,
            EventKind::Move { .. } => ChangeKind::Move,
        }
    }
}

/// One change observed on either side, keyed by path relative to the root.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub kind: ChangeKind,
    pub rel_path: String,
    pub source: Side,
    /// File metadata as known by the originating side, when available
    pub metadata: Option<FileMetadata>,
    pub timestamp: SystemTime,
}

impl SyncEvent {
    pub fn new(kind: ChangeKind, rel_path: String, source: Side, metadata: Option<FileMetadata>) -> Self {
        Self {
            kind,
            rel_path,
            source,
            metadata,
            timestamp: SystemTime::now(),
        }
    }

    /// Metadata for this event, defaulting to a non-existent file record.
    pub fn metadata_or_missing(&self) -> FileMetadata {
        self.metadata
            .clone()
            .unwrap_or_else(|| FileMetadata::missing(PathBuf::from(&self.rel_path)))
    }
}
