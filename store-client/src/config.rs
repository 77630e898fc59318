//! Config & URL Resolver (spec.md §4.1).
//!
//! Unlike `attic-client`'s `Config`, this type is never loaded from or saved
//! to a file: the embedding daemon owns configuration-file parsing (out of
//! scope per spec.md §1), and hands us an already-resolved [`Config`] value.
//! The one piece of "configuration" this crate is responsible for is
//! environment-variable overrides, since those are part of the store
//! client's documented external interface (spec.md §6).

use std::env;

use url::Url;

use crate::auth::AuthContext;
use crate::error::{StoreError, StoreResult};

const PRODUCTION_API_URL: &str = "https://api.snapcraft.io/";
const PRODUCTION_ASSERTIONS_URL: &str = "https://api.snapcraft.io/";
const PRODUCTION_SSO_URL: &str = "https://login.ubuntu.com/";

const STAGING_API_URL: &str = "https://api.staging.snapcraft.io/";
const STAGING_ASSERTIONS_URL: &str = "https://api.staging.snapcraft.io/";
const STAGING_SSO_URL: &str = "https://login.staging.ubuntu.com/";

/// The legacy `SNAPPY_FORCE_CPI_URL` variable is only honored when its value
/// carries this suffix — spec.md §9, Open Question 2. New implementations
/// must preserve this quirk exactly.
const LEGACY_CPI_URL_SUFFIX: &str = "/api/v1/";

/// Delta formats the client is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFormat {
    Xdelta3,
}

impl DeltaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xdelta3 => "xdelta3",
        }
    }
}

/// Immutable-after-construction store client configuration (spec.md §3).
#[derive(Debug, Clone)]
pub struct Config {
    api_base: Url,
    assertions_base: Url,
    sso_base: Url,
    pub store_id: Option<String>,
    pub architecture: String,
    pub series: String,
    pub classic: bool,
    pub info_fields: Vec<String>,
    pub find_fields: Vec<String>,
    pub delta_format: Option<DeltaFormat>,
    pub cache_capacity: usize,
    pub no_cdn: bool,
}

impl Config {
    /// Builds a production configuration, then applies any recognized
    /// environment overrides (spec.md §6).
    pub fn from_env(architecture: impl Into<String>, series: impl Into<String>) -> StoreResult<Self> {
        let staging = env::var("SNAPPY_USE_STAGING_STORE").is_ok();

        let mut api_base = Url::parse(if staging { STAGING_API_URL } else { PRODUCTION_API_URL })
            .map_err(crate::error::from_url)?;
        let mut assertions_base =
            Url::parse(if staging { STAGING_ASSERTIONS_URL } else { PRODUCTION_ASSERTIONS_URL })
                .map_err(crate::error::from_url)?;
        let mut sso_base = Url::parse(if staging { STAGING_SSO_URL } else { PRODUCTION_SSO_URL })
            .map_err(crate::error::from_url)?;

        if let Ok(forced) = env::var("SNAPPY_FORCE_API_URL") {
            api_base = Url::parse(&forced).map_err(crate::error::from_url)?;
        } else if let Ok(legacy) = env::var("SNAPPY_FORCE_CPI_URL") {
            if legacy.ends_with(LEGACY_CPI_URL_SUFFIX) {
                api_base = Url::parse(&legacy).map_err(crate::error::from_url)?;
            } else {
                tracing::warn!(
                    "ignoring SNAPPY_FORCE_CPI_URL: must end in {}",
                    LEGACY_CPI_URL_SUFFIX
                );
            }
        }

        if let Ok(forced) = env::var("SNAPPY_FORCE_ASSERTS_URL") {
            assertions_base = Url::parse(&forced).map_err(crate::error::from_url)?;
        }

        if let Ok(forced) = env::var("SNAPPY_FORCE_SAS_URL") {
            sso_base = Url::parse(&forced).map_err(crate::error::from_url)?;
        }

        let no_cdn = env::var("SNAPPY_FORCE_CPI_NOCDN").is_ok() || env::var("SNAPPY_STORE_NO_CDN").is_ok();
        let delta_format = if env::var("SNAPD_DELTA_FORMAT_EXPERIMENTAL").is_ok() {
            Some(DeltaFormat::Xdelta3)
        } else {
            None
        };

        Ok(Self {
            api_base,
            assertions_base,
            sso_base,
            store_id: None,
            architecture: architecture.into(),
            series: series.into(),
            classic: false,
            info_fields: default_info_fields(),
            find_fields: default_info_fields(),
            delta_format,
            cache_capacity: 5000,
            no_cdn,
        })
    }

    pub fn sso_base(&self) -> &Url {
        &self.sso_base
    }

    pub fn assertions_base(&self) -> &Url {
        &self.assertions_base
    }

    /// Overrides the assertions base URL. Exposed for tests and for callers
    /// building a `Config` without going through environment variables.
    pub fn with_assertions_base(mut self, base: Url) -> Self {
        self.assertions_base = base;
        self
    }

    /// Overrides the store API base URL (the default `base_url` falls back
    /// to when no `AuthContext` proxy override applies). Exposed for tests
    /// and for callers building a `Config` without environment variables.
    pub fn with_api_base(mut self, base: Url) -> Self {
        self.api_base = base;
        self
    }

    /// Overrides the SSO base URL. Exposed for tests and for callers
    /// building a `Config` without environment variables.
    pub fn with_sso_base(mut self, base: Url) -> Self {
        self.sso_base = base;
        self
    }

    /// Resolves the effective API base, honoring a proxy-store indirection
    /// if one is configured through the `AuthContext` (spec.md §4.1).
    pub async fn base_url(&self, auth: Option<&dyn AuthContext>) -> Url {
        if let Some(auth) = auth {
            if let Some(proxy_url) = auth.proxy_store_params(&self.api_base).await {
                return proxy_url;
            }
        }
        self.api_base.clone()
    }

    /// Joins `path` onto `base`, rejecting bases that already carry a query
    /// string (spec.md §4.1).
    pub fn endpoint_url(base: &Url, path: &str, query: &[(&str, String)]) -> StoreResult<Url> {
        if base.query().is_some() {
            return Err(StoreError::InvalidUrl(format!(
                "base URL {base} already has a query string"
            )));
        }

        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidUrl("base URL cannot be a base".into()))?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

fn default_info_fields() -> Vec<String> {
    vec![
        "snap-id",
        "name",
        "revision",
        "version",
        "channel",
        "confinement",
        "download",
        "epoch",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
