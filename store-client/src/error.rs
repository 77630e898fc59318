//! Error conversions from transport-level failures into the taxonomy in
//! [`store_core::error::StoreError`].

pub use store_core::error::{AuthRefreshNeed, SnapActionError, SnapActionErrorDetail};
pub use store_core::{StoreError, StoreResult};

pub(crate) fn from_reqwest(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

pub(crate) fn from_io(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

pub(crate) fn from_json(e: serde_json::Error) -> StoreError {
    StoreError::MalformedResponse(e.to_string())
}

pub(crate) fn from_url(e: url::ParseError) -> StoreError {
    StoreError::InvalidUrl(e.to_string())
}
