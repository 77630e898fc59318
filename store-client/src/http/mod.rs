//! The request pipeline (spec.md §4.3): header injection, the 401-driven
//! refresh dance, and response decoding.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use url::Url;

use crate::auth::{AuthContext, AuthCoordinator, Macaroon, UserCredentials};
use crate::config::Config;
use crate::error::from_reqwest;
use store_core::error::StoreError;
use store_core::StoreResult;

pub use retry::RetryStrategy;

const CLIENT_USER_AGENT: &str = concat!("store-client/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a request targets the v1 or v2 API surface — the two differ in
/// header naming and, for v1, require a wire-protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiLevel {
    V1,
    V2,
}

/// Whether device auth should be attached whenever an `AuthContext` is
/// present, or only for a custom (non-default) store (spec.md §4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAuthNeed {
    Preferred,
    CustomStoreOnly,
}

/// Describes one logical store request, independent of auth/retry plumbing.
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub accept: &'static str,
    pub content_type: Option<&'static str>,
    pub body: Option<Vec<u8>>,
    pub api_level: ApiLevel,
    pub device_auth: DeviceAuthNeed,
    pub extra_headers: Vec<(HeaderName, HeaderValue)>,
}

impl RequestSpec {
    pub fn new(method: Method, url: Url, accept: &'static str, api_level: ApiLevel) -> Self {
        Self {
            method,
            url,
            accept,
            content_type: None,
            body: None,
            api_level,
            device_auth: DeviceAuthNeed::Preferred,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.content_type = Some("application/json");
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.extra_headers.push((name, value));
        self
    }
}

/// Builds, signs, sends, and retries HTTP requests against the store
/// (spec.md §4.3). Generic over the macaroon implementation used by the
/// embedded [`AuthCoordinator`].
pub struct Pipeline<M: Macaroon> {
    http: HttpClient,
    config: Arc<Config>,
    auth: Option<Arc<dyn AuthContext>>,
    coordinator: Option<Arc<AuthCoordinator<M>>>,
}

impl<M: Macaroon> Pipeline<M> {
    pub fn new(
        http: HttpClient,
        config: Arc<Config>,
        auth: Option<Arc<dyn AuthContext>>,
        coordinator: Option<Arc<AuthCoordinator<M>>>,
    ) -> Self {
        Self {
            http,
            config,
            auth,
            coordinator,
        }
    }

    pub fn http_client(&self) -> &HttpClient {
        &self.http
    }

    /// Runs one request through the retry strategy, performing the
    /// up-to-four-attempt 401 refresh dance inside each attempt body so
    /// transport-level retries and auth-refresh retries compose correctly.
    ///
    /// Written as an explicit loop rather than via [`retry::retry_async`]:
    /// that helper takes an `FnMut` thunk, and the thunk here would need to
    /// reborrow `user` mutably on every call while a previous future from
    /// the same closure could still be alive across an `.await` boundary.
    pub async fn send_with_auth(
        &self,
        spec: &RequestSpec,
        mut user: Option<&mut UserCredentials>,
        strategy: &RetryStrategy,
    ) -> StoreResult<Response> {
        let start = std::time::Instant::now();
        let mut refresh_budget = 4u32;

        for attempt in 0..strategy.max_attempts {
            match self.attempt(spec, user.as_deref_mut(), &mut refresh_budget).await {
                Ok(res) => return Ok(res),
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

    async fn attempt(
        &self,
        spec: &RequestSpec,
        mut user: Option<&mut UserCredentials>,
        refresh_budget: &mut u32,
    ) -> StoreResult<Response> {
        loop {
            let res = self.send_once(spec, user.as_deref()).await?;

            if res.status() != StatusCode::UNAUTHORIZED || *refresh_budget == 0 {
                return Ok(res);
            }

            let hints = WwwAuthenticateHints::parse(res.headers());
            if !hints.needs_refresh && !hints.refresh_device_session {
                return Ok(res);
            }

            *refresh_budget -= 1;

            if hints.needs_refresh {
                if let (Some(coordinator), Some(auth), Some(user)) =
                    (&self.coordinator, &self.auth, user.as_deref_mut())
                {
                    let refreshed = coordinator
                        .refresh_user_discharges(user, auth.as_ref())
                        .await?;
                    *user = refreshed;
                }
            }

            if hints.refresh_device_session {
                if let (Some(coordinator), Some(auth)) = (&self.coordinator, &self.auth) {
                    auth.update_device_auth(Default::default()).await;
                    let _ = coordinator.ensure_device_session(auth.as_ref()).await?;
                }
            }
        }
    }

    async fn send_once(
        &self,
        spec: &RequestSpec,
        user: Option<&UserCredentials>,
    ) -> StoreResult<Response> {
        let mut req = self
            .http
            .request(spec.method.clone(), spec.url.clone())
            .timeout(DEFAULT_TIMEOUT);

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(spec.accept));

        if let Some(content_type) = spec.content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        let (arch_header, series_header, classic_header) = match spec.api_level {
            ApiLevel::V1 => (
                "x-ubuntu-architecture",
                "x-ubuntu-series",
                "x-ubuntu-classic",
            ),
            ApiLevel::V2 => (
                "snap-device-architecture",
                "snap-device-series",
                "snap-classic",
            ),
        };
        insert_str(&mut headers, arch_header, &self.config.architecture);
        insert_str(&mut headers, series_header, &self.config.series);
        insert_str(&mut headers, classic_header, &self.config.classic.to_string());
        headers.insert(
            HeaderName::from_static("snap-device-capabilities"),
            HeaderValue::from_static("default-tracks"),
        );

        if spec.api_level == ApiLevel::V1 {
            headers.insert(
                HeaderName::from_static("x-ubuntu-wire-protocol"),
                HeaderValue::from_static("1"),
            );
        }

        for (name, value) in &spec.extra_headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut is_custom_store = false;
        if let Some(auth) = &self.auth {
            if let Some(store_id) = auth.store_id().await {
                is_custom_store = true;
                insert_str(&mut headers, "snap-device-store", &store_id);
            }
        }

        let wants_device_auth = match spec.device_auth {
            DeviceAuthNeed::Preferred => true,
            DeviceAuthNeed::CustomStoreOnly => is_custom_store,
        };

        if wants_device_auth {
            if let (Some(coordinator), Some(auth)) = (&self.coordinator, &self.auth) {
                match coordinator.ensure_device_session(auth.as_ref()).await {
                    Ok(session) => {
                        let header_name = match spec.api_level {
                            ApiLevel::V1 => "x-device-authorization",
                            ApiLevel::V2 => "snap-device-authorization",
                        };
                        insert_str(
                            &mut headers,
                            header_name,
                            &AuthCoordinator::<M>::device_auth_header(&session),
                        );
                    }
                    Err(StoreError::NoSerial) => {
                        tracing::debug!("no device serial assertion; skipping device auth");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(user) = user {
            let header = AuthCoordinator::<M>::user_auth_header(user)?;
            if let Ok(value) = HeaderValue::from_str(&header) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        req = req.headers(headers);
        if let Some(body) = &spec.body {
            req = req.body(body.clone());
        }

        req.send().await.map_err(from_reqwest)
    }

    /// Forces a credential refresh outside the normal 401 dance, for callers
    /// (the snap-action batch) that learn of a soft-expired credential from
    /// an in-band error code rather than the transport layer (spec.md §4.6).
    pub async fn force_refresh(
        &self,
        user: Option<&mut UserCredentials>,
        need: store_core::error::AuthRefreshNeed,
    ) -> StoreResult<()> {
        let (Some(coordinator), Some(auth)) = (&self.coordinator, &self.auth) else {
            return Ok(());
        };

        if need.user {
            if let Some(user) = user {
                let refreshed = coordinator.refresh_user_discharges(user, auth.as_ref()).await?;
                *user = refreshed;
            }
        }

        if need.device {
            auth.update_device_auth(Default::default()).await;
            coordinator.ensure_device_session(auth.as_ref()).await?;
        }

        Ok(())
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[derive(Debug, Default)]
struct WwwAuthenticateHints {
    needs_refresh: bool,
    refresh_device_session: bool,
}

impl WwwAuthenticateHints {
    fn parse(headers: &HeaderMap) -> Self {
        let Some(value) = headers
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        else {
            return Self::default();
        };

        Self {
            needs_refresh: value.contains("needs_refresh=1"),
            refresh_device_session: value.contains("refresh_device_session=1"),
        }
    }
}

fn is_retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Transport(_) | StoreError::Io(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fakes::{FakeAuthContext, FakeMacaroon};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(
        auth: Option<Arc<dyn AuthContext>>,
        coordinator: Option<Arc<AuthCoordinator<FakeMacaroon>>>,
    ) -> Pipeline<FakeMacaroon> {
        let config = Arc::new(Config::from_env("amd64", "16").unwrap());
        Pipeline::new(reqwest::Client::new(), config, auth, coordinator)
    }

    #[tokio::test]
    async fn sends_mandatory_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/snaps/info/hello"))
            .respond_with(|req: &wiremock::Request| {
                assert!(req.headers.contains_key("snap-device-architecture"));
                assert!(req.headers.contains_key("snap-device-series"));
                assert!(req.headers.contains_key("snap-device-capabilities"));
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true}))
            })
            .mount(&server)
            .await;

        let pipeline = pipeline(None, None);
        let url = Url::parse(&format!("{}/v2/snaps/info/hello", server.uri())).unwrap();
        let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V2);

        let res = pipeline
            .send_with_auth(&spec, None, &RetryStrategy::metadata())
            .await
            .unwrap();
        assert!(res.status().is_success());
    }

    #[tokio::test]
    async fn retries_once_on_needs_refresh_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v2/tokens/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "discharge_macaroon": "fresh-discharge"
            })))
            .mount(&server)
            .await;

        let call_count = std::sync::atomic::AtomicU32::new(0);
        Mock::given(method("GET"))
            .and(path("/v2/snaps/info/hello"))
            .respond_with(move |_: &wiremock::Request| {
                let n = call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    ResponseTemplate::new(401)
                        .insert_header("WWW-Authenticate", "Macaroon needs_refresh=1")
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true}))
                }
            })
            .mount(&server)
            .await;

        let coordinator = Arc::new(AuthCoordinator::<FakeMacaroon>::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
            Url::parse(&server.uri()).unwrap(),
        ));
        let auth: Arc<dyn AuthContext> = Arc::new(FakeAuthContext::default());

        let pipeline = pipeline(Some(auth), Some(coordinator));
        let url = Url::parse(&format!("{}/v2/snaps/info/hello", server.uri())).unwrap();
        let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V2);

        let mut user = UserCredentials {
            root: "root-id".into(),
            discharges: vec!["stale-discharge".into()],
        };

        let res = pipeline
            .send_with_auth(&spec, Some(&mut user), &RetryStrategy::metadata())
            .await
            .unwrap();
        assert!(res.status().is_success());
        assert_eq!(user.discharges, vec!["fresh-discharge".to_owned()]);
    }
}
