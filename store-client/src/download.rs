//! The download engine (spec.md §4.7): cache short-circuit, delta-first
//! fetch with fallback, resumable range downloads, rate limiting, and hash
//! verification.

use std::fs::Permissions;
use std::num::NonZeroU32;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::auth::{CloudInfo, Macaroon, UserCredentials};
use crate::delta::DeltaApplier;
use crate::download_cache::{CacheLookup, DownloadCache};
use crate::http::{Pipeline, RetryStrategy};
use store_core::hash::Hash;
use store_core::types::{DeltaInfo, DownloadInfo};
use store_core::{StoreError, StoreResult};

/// The permission a fully-applied delta target should have (spec.md §4.7
/// delta pipeline step 4), matching the mode the teacher gives its own
/// sensitive on-disk files.
const DELTA_TARGET_MODE: u32 = 0o600;

/// A byte-throttled rate limiter: each cell is one byte, so `Quota::per_second(n)`
/// caps sustained throughput at `n` bytes/sec.
pub type DownloadRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Builds a rate limiter allowing bursts of twice the sustained rate
/// (spec.md §4.7).
pub fn rate_limiter(bytes_per_sec: u32) -> Option<Arc<DownloadRateLimiter>> {
    let rate = NonZeroU32::new(bytes_per_sec)?;
    let burst = NonZeroU32::new(bytes_per_sec.saturating_mul(2)).unwrap_or(rate);
    Some(Arc::new(RateLimiter::direct(
        Quota::per_second(rate).allow_burst(burst),
    )))
}

/// A delta the caller has already selected (by matching `from_revision`
/// against the installed revision) plus the on-disk blob it applies
/// against. Delta *selection* is a snap-action-level decision; this module
/// only knows how to fetch-and-apply one.
pub struct DeltaSource<'a> {
    pub info: &'a DeltaInfo,
    pub source_blob: &'a Path,
}

/// Per-call knobs that don't belong on [`DownloadInfo`] itself: the snap
/// name (for error messages), the caller's user credentials (which decide
/// anonymous vs. authenticated URL selection, spec.md §4.7 step 5), and
/// whether a failed download should keep its `.partial` file around.
pub struct DownloadOptions<'a> {
    pub name: &'a str,
    pub user: Option<&'a UserCredentials>,
    pub leave_partial_on_error: bool,
}

/// Downloads `info` to `target`, trying the cache first, then a delta (if
/// one was selected), falling back to a full resumable download.
pub async fn fetch<M: Macaroon>(
    pipeline: &Pipeline<M>,
    cache: &DownloadCache,
    delta_applier: &dyn DeltaApplier,
    delta: Option<DeltaSource<'_>>,
    info: &DownloadInfo,
    target: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
    options: &DownloadOptions<'_>,
) -> StoreResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(crate::error::from_io)?;
    }

    if let CacheLookup::Hit = cache.get(&info.sha3_384, target).await? {
        return Ok(());
    }

    if let Some(delta) = delta {
        match apply_delta(pipeline, delta_applier, delta, info, target, limiter, cloud_info, no_cdn, options).await {
            Ok(()) => {
                cache.put(&info.sha3_384, target).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "delta application failed, falling back to full download");
                let _ = tokio::fs::remove_file(target).await;
            }
        }
    }

    // Anonymous download URL unless the caller has user credentials, in
    // which case the authenticated URL is preferred (spec.md §4.7 step 5).
    let url = match options.user {
        Some(_) => info.url.as_str(),
        None => info.anonymous_url.as_deref().unwrap_or(&info.url),
    };

    let result = download_full(pipeline, url, &info.sha3_384, info.size, target, limiter, cloud_info, no_cdn, options).await;
    if result.is_ok() {
        cache.put(&info.sha3_384, target).await?;
    }
    result
}

async fn apply_delta<M: Macaroon>(
    pipeline: &Pipeline<M>,
    delta_applier: &dyn DeltaApplier,
    delta: DeltaSource<'_>,
    info: &DownloadInfo,
    target: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
    options: &DownloadOptions<'_>,
) -> StoreResult<()> {
    let delta_path = target.with_extension("delta");
    download_full(
        pipeline,
        &delta.info.url,
        &delta.info.sha3_384,
        delta.info.size,
        &delta_path,
        limiter,
        cloud_info,
        no_cdn,
        options,
    )
    .await?;

    let result = delta_applier.apply(delta.source_blob, &delta_path, target).await;
    let _ = tokio::fs::remove_file(&delta_path).await;
    result?;

    tokio::fs::set_permissions(target, Permissions::from_mode(DELTA_TARGET_MODE))
        .await
        .map_err(crate::error::from_io)?;

    verify_hash(target, &info.sha3_384).await
}

/// Downloads `url` into `target`, resuming from a `.partial` sibling file if
/// one already exists (spec.md §4.7, scenario S2). Retries transport errors
/// per [`RetryStrategy::download`], and retries once from scratch on a hash
/// mismatch rather than trusting a corrupt partial forever.
async fn download_full<M: Macaroon>(
    pipeline: &Pipeline<M>,
    url: &str,
    expected_hash: &Hash,
    expected_size: u64,
    target: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
    options: &DownloadOptions<'_>,
) -> StoreResult<()> {
    let partial = target.with_extension("partial");

    let result = download_full_attempts(pipeline, url, expected_hash, expected_size, target, &partial, limiter, cloud_info, no_cdn, options).await;

    if result.is_err() && !options.leave_partial_on_error {
        if let Ok(meta) = tokio::fs::metadata(&partial).await {
            if meta.len() == 0 {
                let _ = tokio::fs::remove_file(&partial).await;
            }
        }
    }

    result
}

async fn download_full_attempts<M: Macaroon>(
    pipeline: &Pipeline<M>,
    url: &str,
    expected_hash: &Hash,
    expected_size: u64,
    target: &Path,
    partial: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
    options: &DownloadOptions<'_>,
) -> StoreResult<()> {
    for restart in 0..2u32 {
        download_with_resume(pipeline, url, expected_size, partial, limiter, cloud_info, no_cdn)
            .await
            .map_err(|err| map_402(err, options.name))?;

        match verify_hash(partial, expected_hash).await {
            Ok(()) => {
                tokio::fs::rename(partial, target)
                    .await
                    .map_err(crate::error::from_io)?;
                return Ok(());
            }
            Err(e) if restart == 0 => {
                tracing::warn!(error = %e, "downloaded blob failed hash verification, retrying from scratch");
                let _ = tokio::fs::remove_file(partial).await;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("loop always returns or propagates on its second iteration")
}

/// Store downloads signal "buy this snap first" as a plain 402 on the blob
/// URL, not through the commerce API's typed response body (spec.md §4.7).
fn map_402(err: StoreError, name: &str) -> StoreError {
    match err {
        StoreError::DownloadError { status: 402, .. } => StoreError::PaymentDeclined { name: name.to_owned() },
        other => other,
    }
}

async fn download_with_resume<M: Macaroon>(
    pipeline: &Pipeline<M>,
    url: &str,
    expected_size: u64,
    partial: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
) -> StoreResult<()> {
    let strategy = RetryStrategy::download();
    let start = std::time::Instant::now();

    for attempt in 0..strategy.max_attempts {
        let already = tokio::fs::metadata(partial).await.map(|m| m.len()).unwrap_or(0);
        if expected_size > 0 && already >= expected_size {
            return Ok(());
        }

        match download_stream(pipeline, url, already, partial, limiter, cloud_info, no_cdn).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let is_last = attempt + 1 >= strategy.max_attempts;
                if !is_retryable(&err) || is_last {
                    return Err(err);
                }
                let delay = strategy.delay_for(attempt);
                if start.elapsed() + delay >= strategy.max_elapsed {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("max_attempts is always >= 1")
}

fn is_retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Transport(_) | StoreError::Io(_))
}

/// Streams one attempt at `url` into `partial`, resuming from byte `from`
/// via a `Range` header, and throttling writes through `limiter` if given.
/// Exposed so callers that want to drive their own progress reporting can
/// call it directly instead of going through [`fetch`].
pub async fn download_stream<M: Macaroon>(
    pipeline: &Pipeline<M>,
    url: &str,
    from: u64,
    partial: &Path,
    limiter: Option<&DownloadRateLimiter>,
    cloud_info: &CloudInfo,
    no_cdn: bool,
) -> StoreResult<()> {
    let mut req = pipeline.http_client().get(url);
    req = req.header("snap-cdn", cdn_header(cloud_info, no_cdn));

    let mut file = if from > 0 {
        req = req.header(RANGE, format!("bytes={from}-"));
        OpenOptions::new()
            .append(true)
            .open(partial)
            .await
            .map_err(crate::error::from_io)?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(partial)
            .await
            .map_err(crate::error::from_io)?
    };

    let res = req.send().await.map_err(crate::error::from_reqwest)?;
    if from > 0 && res.status() != StatusCode::PARTIAL_CONTENT {
        // The server ignored our Range request; restart from scratch.
        drop(file);
        let _ = tokio::fs::remove_file(partial).await;
        return Box::pin(download_stream(pipeline, url, 0, partial, limiter, cloud_info, no_cdn)).await;
    }
    if !res.status().is_success() {
        return Err(StoreError::DownloadError {
            status: res.status().as_u16(),
            url: url.to_owned(),
        });
    }

    let mut stream = res.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(crate::error::from_reqwest)?;
        if let (Some(limiter), Some(n)) = (limiter, NonZeroU32::new(chunk.len() as u32)) {
            let _ = limiter.until_n_ready(n).await;
        }
        file.write_all(&chunk).await.map_err(crate::error::from_io)?;
    }
    file.flush().await.map_err(crate::error::from_io)?;
    Ok(())
}

fn cdn_header(cloud_info: &CloudInfo, no_cdn: bool) -> String {
    if no_cdn {
        return "none".to_owned();
    }

    let mut parts = Vec::new();
    if let Some(name) = &cloud_info.name {
        parts.push(format!("cloud-name=\"{name}\""));
    }
    if let Some(region) = &cloud_info.region {
        parts.push(format!("region=\"{region}\""));
    }
    if let Some(zone) = &cloud_info.availability_zone {
        parts.push(format!("availability-zone=\"{zone}\""));
    }

    if parts.is_empty() {
        "none".to_owned()
    } else {
        parts.join(" ")
    }
}

async fn verify_hash(path: &Path, expected: &Hash) -> StoreResult<()> {
    let file = tokio::fs::File::open(path).await.map_err(crate::error::from_io)?;
    let actual = Hash::sha3_384_of_reader(file)
        .await
        .map_err(crate::error::from_io)?;
    if &actual != expected {
        return Err(StoreError::HashMismatch {
            name: path.display().to_string(),
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}
