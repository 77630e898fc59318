//! The data model shared between every store operation (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::hash::Hash;

/// A snap already installed on the system, given as context to the
/// snap-action batch so the server can compute refreshes relative to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentSnap {
    pub instance_name: String,
    pub snap_id: String,
    pub revision: i64,
    pub tracking_channel: Option<String>,
    pub epoch: Epoch,
    pub refresh_date: Option<String>,
    pub cohort_key: Option<String>,
    pub ignore_validation: bool,
    pub block: Vec<i64>,
}

impl CurrentSnap {
    pub fn new(instance_name: impl Into<String>, snap_id: impl Into<String>, revision: i64) -> StoreResult<Self> {
        let instance_name = instance_name.into();
        let snap_id = snap_id.into();

        if instance_name.is_empty() {
            return Err(StoreError::Other("instance name must not be empty".into()));
        }
        if snap_id.is_empty() {
            return Err(StoreError::Other("snap-id must not be empty".into()));
        }

        Ok(Self {
            instance_name,
            snap_id,
            revision,
            tracking_channel: None,
            epoch: Epoch::default(),
            refresh_date: None,
            cohort_key: None,
            ignore_validation: false,
            block: Vec::new(),
        })
    }

    /// The `name_key` suffix of the instance name, if any (e.g. `foo_bar` →
    /// `Some("bar")`).
    pub fn instance_key_part(&self) -> Option<&str> {
        self.instance_name.split_once('_').map(|(_, key)| key)
    }
}

/// An epoch, as the store's compatibility-versioning scheme. A zero epoch is
/// serialized as `null` on install/download requests (spec.md §4.6, testable
/// property #8) to signal epoch-awareness without claiming a specific read
/// epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub read: Vec<u32>,
    pub write: Vec<u32>,
}

impl Epoch {
    pub fn is_zero(&self) -> bool {
        self.read.iter().all(|&r| r == 0) && self.write.iter().all(|&w| w == 0)
            && (self.read.is_empty() || self.read == [0])
            && (self.write.is_empty() || self.write == [0])
    }
}

/// One requested operation within a snap-action batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapAction {
    pub kind: SnapActionKind,
    pub instance_name: String,
    pub snap_id: Option<String>,
    pub channel: Option<String>,
    pub revision: Option<i64>,
    pub cohort_key: Option<String>,
    pub epoch: Option<Epoch>,
    pub ignore_validation: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapActionKind {
    Install,
    Download,
    Refresh,
}

impl SnapAction {
    /// If a revision is pinned, the channel must be cleared before
    /// marshalling (spec.md §4.6).
    pub fn normalized(mut self) -> Self {
        if self.revision.is_some() {
            self.channel = None;
        }
        self
    }
}

/// The outcome of a single successful install/refresh/download action.
#[derive(Debug, Clone)]
pub struct SnapActionResult {
    pub instance_name: String,
    pub snap_id: String,
    pub name: String,
    pub revision: i64,
    pub channel: Option<String>,
    pub redirect_channel: Option<String>,
    pub epoch: Epoch,
    pub download: Option<DownloadInfo>,
}

/// Download metadata for a snap, as returned from info/find/snap-action
/// responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub anonymous_url: Option<String>,
    pub sha3_384: Hash,
    pub size: u64,
    pub deltas: Vec<DeltaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaInfo {
    pub format: String,
    pub from_revision: i64,
    pub to_revision: i64,
    pub url: String,
    pub sha3_384: Hash,
    pub size: u64,
}
