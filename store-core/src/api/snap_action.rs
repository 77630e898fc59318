//! Wire shapes for `POST v2/snaps/refresh` (the batched install/refresh/
//! download protocol, spec.md §4.6).

use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::types::Epoch;

#[derive(Debug, Serialize)]
pub struct SnapActionRequestBody {
    pub context: Vec<ContextEntry>,
    pub actions: Vec<ActionEntry>,
    pub fields: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextEntry {
    #[serde(rename = "instance-key")]
    pub instance_key: String,
    #[serde(rename = "snap-id")]
    pub snap_id: String,
    pub revision: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_channel: Option<String>,
    pub epoch: Epoch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_validation: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionEntry {
    pub action: &'static str,
    #[serde(rename = "instance-key")]
    pub instance_key: String,
    pub name: Option<String>,
    #[serde(rename = "snap-id")]
    pub snap_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort_key: Option<String>,
    /// `Some(None)` serializes as an explicit `null`; `None` omits the field
    /// entirely. Refresh actions must omit it (spec.md §4.6, testable
    /// property #8); install/download actions always set `Some(_)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<Option<Epoch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_validation: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SnapActionResponseBody {
    pub results: Vec<ResultEntry>,
    #[serde(default, rename = "error-list")]
    pub error_list: Vec<TopLevelError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultEntry {
    pub result: ResultKind,
    #[serde(default)]
    pub instance_key: Option<String>,
    #[serde(default)]
    pub snap_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub snap: Option<ResultSnap>,
    #[serde(default)]
    pub effective_channel: Option<String>,
    #[serde(default)]
    pub redirect_channel: Option<String>,
    #[serde(default)]
    pub error: Option<ResultError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultKind {
    Install,
    Refresh,
    Download,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultSnap {
    pub name: String,
    pub snap_id: String,
    pub revision: i64,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub epoch: Epoch,
    #[serde(default)]
    pub download: Option<ResultDownload>,
}

#[derive(Debug, Deserialize)]
pub struct ResultDownload {
    pub url: String,
    #[serde(default)]
    pub anonymous_url: Option<String>,
    pub sha3_384: Hash,
    pub size: u64,
    #[serde(default)]
    pub deltas: Vec<ResultDelta>,
}

#[derive(Debug, Deserialize)]
pub struct ResultDelta {
    pub format: String,
    pub from_revision: i64,
    pub to_revision: i64,
    pub url: String,
    pub sha3_384: Hash,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct ResultError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub releases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopLevelError {
    pub code: String,
    pub message: String,
}
