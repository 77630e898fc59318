//! Assertion retrieval (spec.md §4.8).

use reqwest::Method;
use serde::Deserialize;

use crate::auth::Macaroon;
use crate::config::Config;
use crate::http::{ApiLevel, DeviceAuthNeed, Pipeline, RequestSpec, RetryStrategy};
use store_core::error::StoreError;
use store_core::StoreResult;

const ASSERTIONS_ACCEPT: &str = "application/x.ubuntu.assertion";

#[derive(Debug, Deserialize)]
struct AssertionServiceError {
    #[allow(dead_code)]
    status: Option<u16>,
    title: Option<String>,
}

/// Rebuilds the `X-Ubuntu-Assertions-Primary-Key-N` style headers an
/// `AssertionNotFound` error carries, one per path component of the
/// primary key actually requested.
fn reconstruct_primary_key_headers(primary_key: &[String]) -> Vec<(String, String)> {
    primary_key
        .iter()
        .enumerate()
        .map(|(i, value)| (format!("x-ubuntu-assertions-primary-key-{i}"), value.clone()))
        .collect()
}

/// The maximum assertion format version this client declares support for,
/// per assertion type.
pub fn max_format_for(assertion_type: &str) -> u32 {
    match assertion_type {
        "snap-declaration" => 5,
        "account" => 1,
        "account-key" => 1,
        _ => 0,
    }
}

/// Fetches a single assertion by type and primary key, returning the raw
/// assertion bytes on success.
pub async fn fetch_assertion<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    assertion_type: &str,
    primary_key: &[String],
) -> StoreResult<Vec<u8>> {
    let path = format!(
        "api/v1/snaps/assertions/{}/{}",
        assertion_type,
        primary_key.join("/")
    );
    let max_format = max_format_for(assertion_type);
    let url = Config::endpoint_url(
        config.assertions_base(),
        &path,
        &[("max-format", max_format.to_string())],
    )?;

    let spec = RequestSpec {
        device_auth: DeviceAuthNeed::CustomStoreOnly,
        ..RequestSpec::new(Method::GET, url, ASSERTIONS_ACCEPT, ApiLevel::V1)
    };

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::metadata())
        .await?;

    let status = res.status();
    if status.is_success() {
        return Ok(res.bytes().await.map_err(crate::error::from_reqwest)?.to_vec());
    }

    if status.as_u16() == 404 {
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        if content_type.starts_with("application/json")
            || content_type.starts_with("application/problem+json")
        {
            let body: AssertionServiceError =
                res.json().await.map_err(crate::error::from_reqwest)?;
            if let Some(title) = body.title {
                return Err(StoreError::AssertionServiceError(title));
            }
        }

        return Err(StoreError::AssertionNotFound {
            typ: assertion_type.to_owned(),
            primary_key: reconstruct_primary_key_headers(primary_key),
        });
    }

    Err(StoreError::AssertionServiceError(format!(
        "unexpected status {status}"
    )))
}
