//! The `Store` façade (spec.md §3): the single entry point an embedding
//! daemon constructs once, bundling configuration, the request pipeline,
//! the auth coordinator, and the download cache behind the individual
//! operation modules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client as HttpClient;
use tokio::sync::Mutex as AsyncMutex;

use crate::assertions;
use crate::auth::{AuthContext, AuthCoordinator, CloudInfo, Macaroon, UserCredentials};
use crate::commerce;
use crate::config::Config;
use crate::connectivity;
use crate::delta::{DeltaApplier, ProcessDeltaApplier};
use crate::discovery::{self, SnapAdder, SnapInfo};
use crate::download::{self, DeltaSource, DownloadOptions, DownloadRateLimiter};
use crate::download_cache::DownloadCache;
use crate::http::Pipeline;
use crate::snap_action::{self, SnapActionOptions, SnapActionOutcome};
use store_core::api::search::Search;
use store_core::types::{CurrentSnap, DownloadInfo, SnapAction};
use store_core::StoreResult;

/// The top-level entry point an embedding daemon constructs once and reuses
/// for the lifetime of the process (spec.md §3). Thin delegating methods
/// over the individual operation modules; `Store` itself only owns the
/// shared state those modules need (the pipeline, the cache, credentials
/// plumbing).
pub struct Store<M: Macaroon> {
    config: Arc<Config>,
    pipeline: Pipeline<M>,
    coordinator: Arc<AuthCoordinator<M>>,
    auth: Option<Arc<dyn AuthContext>>,
    cache: DownloadCache,
    delta_applier: Arc<dyn DeltaApplier>,
    rate_limiter: Option<Arc<DownloadRateLimiter>>,
    currency_slot: AsyncMutex<Option<String>>,
}

impl<M: Macaroon> Store<M> {
    /// Builds a `Store` from an already-resolved [`Config`] and download
    /// cache directory. `auth` is `None` for anonymous-only use (search,
    /// info, unauthenticated downloads); device/user credential persistence
    /// requires it.
    ///
    /// Async because resolving the coordinator's store base honors a proxy
    /// store indirection through `auth`, the same way every other request
    /// does (spec.md §4.1).
    pub async fn new(config: Config, cache_dir: PathBuf, auth: Option<Arc<dyn AuthContext>>) -> Self {
        let config = Arc::new(config);
        let http = HttpClient::new();

        let store_base = config.base_url(auth.as_deref()).await;
        let coordinator = Arc::new(AuthCoordinator::<M>::new(
            http.clone(),
            store_base,
            config.sso_base().clone(),
        ));

        let pipeline = Pipeline::new(http, Arc::clone(&config), auth.clone(), Some(Arc::clone(&coordinator)));
        let cache = DownloadCache::new(cache_dir, config.cache_capacity);

        Self {
            config,
            pipeline,
            coordinator,
            auth,
            cache,
            delta_applier: Arc::new(ProcessDeltaApplier::default()),
            rate_limiter: None,
            currency_slot: AsyncMutex::new(None),
        }
    }

    /// Swaps in a different delta-applying collaborator, e.g. in tests.
    pub fn set_delta_applier(&mut self, applier: Arc<dyn DeltaApplier>) {
        self.delta_applier = applier;
    }

    /// Changes the download cache's capacity in place (spec.md §3). A
    /// capacity of zero disables caching without losing what's configured
    /// elsewhere.
    pub fn set_cache_downloads(&mut self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    /// Caps sustained download throughput; `None` removes the cap.
    pub fn set_download_rate_limit(&mut self, bytes_per_sec: Option<u32>) {
        self.rate_limiter = bytes_per_sec.and_then(download::rate_limiter);
    }

    /// The store's best currency guess for the current session, learned
    /// from the `X-Suggested-Currency` header on the most recent info/find
    /// response (spec.md §4.5).
    pub async fn suggested_currency(&self) -> Option<String> {
        self.currency_slot.lock().await.clone()
    }

    pub async fn snap_info(&self, name: &str) -> StoreResult<SnapInfo> {
        discovery::snap_info(&self.pipeline, &self.config, name, &self.currency_slot).await
    }

    pub async fn find(&self, search: &Search) -> StoreResult<Vec<serde_json::Value>> {
        discovery::find(&self.pipeline, &self.config, search, &self.currency_slot).await
    }

    pub async fn sections(&self) -> StoreResult<Vec<String>> {
        discovery::sections(&self.pipeline, &self.config).await
    }

    /// Streams the full package-name catalog; see [`discovery::write_catalogs`].
    pub async fn write_catalogs(
        &self,
        writer: impl std::io::Write + Send + 'static,
        adder: impl SnapAdder + 'static,
    ) -> StoreResult<()> {
        discovery::write_catalogs(&self.config, writer, adder).await
    }

    pub async fn snap_action(
        &self,
        user: Option<&mut UserCredentials>,
        current: &[CurrentSnap],
        actions: &[SnapAction],
        options: SnapActionOptions,
    ) -> StoreResult<SnapActionOutcome> {
        snap_action::snap_action(&self.pipeline, &self.config, user, current, actions, options).await
    }

    pub async fn fetch_assertion(&self, assertion_type: &str, primary_key: &[String]) -> StoreResult<Vec<u8>> {
        assertions::fetch_assertion(&self.pipeline, &self.config, assertion_type, primary_key).await
    }

    pub async fn buy(
        &self,
        user: &mut UserCredentials,
        snap_id: &str,
        price: Option<f64>,
        currency: Option<&str>,
    ) -> StoreResult<()> {
        commerce::buy(&self.pipeline, &self.config, user, snap_id, price, currency).await
    }

    pub async fn ready_to_buy(&self, user: &mut UserCredentials) -> StoreResult<()> {
        commerce::ready_to_buy(&self.pipeline, &self.config, user).await
    }

    pub async fn create_cohorts(
        &self,
        user: Option<&mut UserCredentials>,
        snaps: &[String],
    ) -> StoreResult<HashMap<String, String>> {
        commerce::create_cohorts(&self.pipeline, &self.config, user, snaps).await
    }

    pub async fn check_connectivity(&self) -> StoreResult<HashMap<String, bool>> {
        connectivity::check(&self.pipeline, &self.config).await
    }

    /// Logs a user in against the SSO, without touching `AuthContext` (user
    /// credentials are the caller's to persist).
    pub async fn login_user(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> StoreResult<UserCredentials> {
        self.coordinator.login_user(username, password, otp).await
    }

    /// Downloads `info` to `target`, trying the cache, then `delta` if one
    /// was selected, then falling back to a full resumable download
    /// (spec.md §4.7).
    pub async fn download(
        &self,
        delta: Option<DeltaSource<'_>>,
        info: &DownloadInfo,
        target: &Path,
        options: &DownloadOptions<'_>,
    ) -> StoreResult<()> {
        let cloud_info = match &self.auth {
            Some(auth) => auth.cloud_info().await,
            None => CloudInfo::default(),
        };

        download::fetch(
            &self.pipeline,
            &self.cache,
            self.delta_applier.as_ref(),
            delta,
            info,
            target,
            self.rate_limiter.as_deref(),
            &cloud_info,
            self.config.no_cdn,
            options,
        )
        .await
    }
}
