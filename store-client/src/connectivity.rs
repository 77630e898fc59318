//! Connectivity check (spec.md §4.10): probes the store's info endpoint for
//! the `core` snap, then HEADs the CDN download URL and records the final
//! post-redirect host.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;

use crate::auth::Macaroon;
use crate::config::Config;
use crate::http::{ApiLevel, Pipeline, RequestSpec, RetryStrategy};
use store_core::error::StoreError;
use store_core::StoreResult;

#[derive(Debug, Deserialize)]
struct CoreInfoResponse {
    #[serde(rename = "channel-map")]
    channel_map: Vec<ChannelMapEntry>,
}

#[derive(Debug, Deserialize)]
struct ChannelMapEntry {
    download: DownloadField,
}

#[derive(Debug, Deserialize)]
struct DownloadField {
    url: String,
}

/// `host -> reachable` for the store API host and the CDN host the `core`
/// snap currently resolves to.
pub async fn check<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
) -> StoreResult<HashMap<String, bool>> {
    let mut results = HashMap::new();

    let api_base = config.base_url(None).await;
    let api_host = api_base.host_str().unwrap_or_default().to_owned();
    results.insert(api_host, true);

    let url = Config::endpoint_url(&api_base, "v2/snaps/info/core", &[("fields", "download".into())])?;
    let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V2);

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::connectivity())
        .await?;

    if !res.status().is_success() {
        return Ok(results);
    }

    let info: CoreInfoResponse = res.json().await.map_err(crate::error::from_reqwest)?;
    let Some(download_url) = info
        .channel_map
        .first()
        .map(|entry| entry.download.url.clone())
    else {
        return Ok(results);
    };

    let cdn_res = pipeline
        .http_client()
        .head(&download_url)
        .send()
        .await
        .map_err(crate::error::from_reqwest)?;

    let cdn_host = cdn_res.url().host_str().unwrap_or_default().to_owned();
    results.insert(cdn_host, cdn_res.status().is_success() || cdn_res.status().is_redirection());

    Ok(results)
}
