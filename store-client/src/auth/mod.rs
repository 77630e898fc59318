//! Dual-layer credential model (spec.md §4.4) and the external collaborator
//! traits an embedding daemon implements to supply them.
//!
//! Macaroon cryptography itself is out of scope (spec.md §1): [`Macaroon`] is
//! a trait for an opaque crypto service, and [`AuthContext`] is the seam
//! through which the daemon supplies device identity, persists refreshed
//! credentials, and optionally reroutes requests through a proxy store.

pub mod coordinator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

pub use coordinator::AuthCoordinator;

/// A user's root macaroon plus its bound discharge macaroons, as returned by
/// the SSO login dance (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub root: String,
    pub discharges: Vec<String>,
}

/// Device identity: the serial assertion macaroon (set once, by enrollment)
/// and the session macaroon (refreshed lazily, by [`AuthCoordinator`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub serial: Option<String>,
    pub session: Option<String>,
}

/// CDN routing hints attached to download requests (spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct CloudInfo {
    pub name: Option<String>,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
}

/// Opaque bundle a device presents to the store's session-nonce exchange,
/// signed by the daemon against a store-issued nonce (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct DeviceSessionRequestParams {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// The external collaborator through which [`AuthCoordinator`] reads and
/// persists credentials, and through which the request pipeline learns
/// store identity and CDN routing (spec.md §9's six-or-seven operations).
#[async_trait]
pub trait AuthContext: Send + Sync {
    /// Current device credentials.
    async fn device(&self) -> DeviceCredentials;

    /// Persists updated device credentials after a session refresh.
    async fn update_device_auth(&self, device: DeviceCredentials);

    /// Persists updated user credentials after a login or discharge refresh.
    async fn update_user_auth(&self, user: UserCredentials);

    /// The store identifier to send as the store header, if any.
    async fn store_id(&self) -> Option<String>;

    /// Builds the signed request body exchanged for a session macaroon,
    /// binding the daemon's device identity to a store-issued `nonce`.
    async fn device_session_request_params(&self, nonce: &str) -> DeviceSessionRequestParams;

    /// If a proxy store is configured, the base URL requests should be sent
    /// to instead of `default_base` (spec.md §4.1).
    async fn proxy_store_params(&self, default_base: &Url) -> Option<Url>;

    /// CDN routing hints to attach to download requests.
    async fn cloud_info(&self) -> CloudInfo;
}

/// The opaque macaroon crypto service. Real implementations wrap a
/// macaroon library; out of scope here per spec.md §1, this crate depends
/// only on the trait.
pub trait Macaroon: Send + Sync {
    /// Serializes to the wire (base64) form.
    fn serialize(&self) -> String;

    /// Parses a macaroon from its wire form.
    fn deserialize(s: &str) -> Result<Self, MacaroonError>
    where
        Self: Sized;

    /// Binds a discharge macaroon to the signature of its root, as required
    /// before the discharge may be sent alongside the root (spec.md §4.4).
    fn bind(&self, root: &Self) -> Self
    where
        Self: Sized;

    /// Extracts the location of any third-party caveat, if present — used
    /// to find which discharges need refreshing against the SSO location.
    fn third_party_location(&self) -> Option<String>;
}

/// A macaroon failed to parse.
#[derive(Debug, displaydoc::Display)]
pub enum MacaroonError {
    /// malformed macaroon: {0}
    Malformed(String),
}

impl std::error::Error for MacaroonError {}
