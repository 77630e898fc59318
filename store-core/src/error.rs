//! The store client error taxonomy.

use std::collections::HashMap;
use std::error::Error as StdError;

use displaydoc::Display;

use crate::hash::Hash;

pub type StoreResult<T> = Result<T, StoreError>;

/// The fixed set of error kinds a caller of the store client can observe.
///
/// Transport-level failures and HTTP status codes are translated into one of
/// these before they reach the caller; see `spec.md` §7.
#[derive(Debug, Display)]
pub enum StoreError {
    /// Not authenticated.
    Unauthenticated,
    /// Invalid credentials.
    InvalidCredentials,
    /// No device serial assertion is available.
    NoSerial,

    /// Snap "{name}" not found.
    SnapNotFound { name: String },
    /// No update available for "{name}".
    NoUpdateAvailable { name: String },
    /// Invalid search query.
    BadQuery,
    /// Invalid scope "{0}".
    InvalidScope(String),

    /// Too many requests.
    TooManyRequests,

    /// Hash mismatch for "{name}": expected {expected}, got {actual}.
    HashMismatch {
        name: String,
        expected: Hash,
        actual: Hash,
    },

    /// Download of {url} failed with status {status}.
    DownloadError { status: u16, url: String },

    /// Please buy "{name}" before installing it.
    PaymentDeclined { name: String },
    /// No payment methods are registered.
    NoPaymentMethods,
    /// Terms of service have not been accepted.
    TosNotAccepted,

    /// One or more snap actions failed: {0}
    SnapAction(SnapActionError),

    /// Assertion {typ}/{primary_key:?} not found.
    AssertionNotFound {
        typ: String,
        primary_key: Vec<(String, String)>,
    },
    /// Assertion service error: {0}
    AssertionServiceError(String),

    /// HTTP transport error: {0}
    Transport(String),
    /// Malformed response: {0}
    MalformedResponse(String),
    /// Invalid URL: {0}
    InvalidUrl(String),
    /// I/O error: {0}
    Io(String),
    /// {0}
    Other(String),
}

impl StdError for StoreError {}

/// The aggregated result of a snap-action batch, partitioned per spec.md
/// §4.6: one map per action kind, keyed by the name the server used to
/// identify the failure, plus an overflow bucket for errors that couldn't be
/// attributed to a specific instance name.
#[derive(Debug, Default, Clone)]
pub struct SnapActionError {
    pub install_errors: HashMap<String, SnapActionErrorDetail>,
    pub refresh_errors: HashMap<String, SnapActionErrorDetail>,
    pub download_errors: HashMap<String, SnapActionErrorDetail>,
    pub other_errors: Vec<SnapActionErrorDetail>,
    pub no_results: bool,
}

#[derive(Debug, Clone, Display)]
/// {code}: {message}
pub struct SnapActionErrorDetail {
    pub code: String,
    pub message: String,
    pub releases: Vec<String>,
}

impl std::fmt::Display for SnapActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} install, {} refresh, {} download, {} other",
            self.install_errors.len(),
            self.refresh_errors.len(),
            self.download_errors.len(),
            self.other_errors.len()
        )
    }
}

impl SnapActionError {
    pub fn is_empty(&self) -> bool {
        self.install_errors.is_empty()
            && self.refresh_errors.is_empty()
            && self.download_errors.is_empty()
            && self.other_errors.is_empty()
    }

    /// Scans the "other" bucket for the soft-expiry sentinels that drive the
    /// at-most-two-retries policy in spec.md §4.6.
    pub fn needs_auth_refresh(&self) -> AuthRefreshNeed {
        let mut need = AuthRefreshNeed::default();
        for detail in &self.other_errors {
            match detail.code.as_str() {
                "user-authorization-needs-refresh" => need.user = true,
                "device-authorization-needs-refresh" => need.device = true,
                _ => {}
            }
        }
        need
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuthRefreshNeed {
    pub user: bool,
    pub device: bool,
}

impl AuthRefreshNeed {
    pub fn any(&self) -> bool {
        self.user || self.device
    }
}

impl From<crate::hash::Error> for StoreError {
    fn from(e: crate::hash::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_action_error_reports_emptiness() {
        let mut err = SnapActionError::default();
        assert!(err.is_empty());

        err.refresh_errors.insert(
            "foo".into(),
            SnapActionErrorDetail {
                code: "no-update-available".into(),
                message: "no update".into(),
                releases: vec![],
            },
        );
        assert!(!err.is_empty());
    }

    #[test]
    fn detects_soft_expiry_sentinels() {
        let mut err = SnapActionError::default();
        err.other_errors.push(SnapActionErrorDetail {
            code: "user-authorization-needs-refresh".into(),
            message: "expired".into(),
            releases: vec![],
        });
        err.other_errors.push(SnapActionErrorDetail {
            code: "device-authorization-needs-refresh".into(),
            message: "expired".into(),
            releases: vec![],
        });

        let need = err.needs_auth_refresh();
        assert!(need.user);
        assert!(need.device);
        assert!(need.any());
    }
}
