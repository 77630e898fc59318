//! End-to-end coverage of the store's concrete scenarios, driven through
//! the [`Store`] façade rather than an individual operation module.

use std::sync::Arc;

use async_trait::async_trait;
use store_client::auth::{
    AuthContext, CloudInfo, DeviceCredentials, DeviceSessionRequestParams, Macaroon, MacaroonError,
    UserCredentials,
};
use store_client::Config;
use store_client::Store;
use store_core::types::{CurrentSnap, DownloadInfo, SnapAction, SnapActionKind};
use store_core::{Hash, StoreError};
use tempfile::tempdir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Minimal macaroon: an opaque id plus an optional third-party location,
/// carried verbatim through (de)serialization so the SSO-refresh matching
/// in `AuthCoordinator::refresh_user_discharges` (spec.md §4.4) actually
/// exercises its location check.
#[derive(Debug, Clone)]
struct TestMacaroon {
    id: String,
    location: Option<String>,
}

impl Macaroon for TestMacaroon {
    fn serialize(&self) -> String {
        match &self.location {
            Some(loc) => format!("{}|{}", self.id, loc),
            None => self.id.clone(),
        }
    }

    fn deserialize(s: &str) -> Result<Self, MacaroonError> {
        match s.split_once('|') {
            Some((id, loc)) => Ok(Self {
                id: id.to_owned(),
                location: Some(loc.to_owned()),
            }),
            None => Ok(Self {
                id: s.to_owned(),
                location: None,
            }),
        }
    }

    fn bind(&self, _root: &Self) -> Self {
        self.clone()
    }

    fn third_party_location(&self) -> Option<String> {
        self.location.clone()
    }
}

#[derive(Default)]
struct TestAuthContext;

#[async_trait]
impl AuthContext for TestAuthContext {
    async fn device(&self) -> DeviceCredentials {
        DeviceCredentials::default()
    }

    async fn update_device_auth(&self, _device: DeviceCredentials) {}

    async fn update_user_auth(&self, _user: UserCredentials) {}

    async fn store_id(&self) -> Option<String> {
        None
    }

    async fn device_session_request_params(&self, _nonce: &str) -> DeviceSessionRequestParams {
        DeviceSessionRequestParams {
            body: Vec::new(),
            content_type: "application/json",
        }
    }

    async fn proxy_store_params(&self, _default_base: &Url) -> Option<Url> {
        None
    }

    async fn cloud_info(&self) -> CloudInfo {
        CloudInfo::default()
    }
}

async fn store(server: &MockServer, auth: Option<Arc<dyn AuthContext>>) -> (Store<TestMacaroon>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = Config::from_env("amd64", "16")
        .unwrap()
        .with_api_base(Url::parse(&server.uri()).unwrap())
        .with_assertions_base(Url::parse(&server.uri()).unwrap())
        .with_sso_base(Url::parse(&server.uri()).unwrap());
    let store = Store::new(config, dir.path().join("cache"), auth).await;
    (store, dir)
}

/// S1: a cache hit delivers the file without any HTTP call at all.
#[tokio::test]
async fn s1_download_hit_never_touches_the_network() {
    let server = MockServer::start().await;
    // No mocks registered: any HTTP call would 404 and fail the test.
    let dir = tempdir().unwrap();
    let cache_dir = dir.path().join("cache");

    let bytes = b"already-downloaded";
    let hash = Hash::sha3_384_of_bytes(bytes);
    let seed = dir.path().join("seed.snap");
    tokio::fs::write(&seed, bytes).await.unwrap();

    let cache = store_client::download_cache::DownloadCache::new(cache_dir.clone(), 10);
    cache.put(&hash, &seed).await.unwrap();
    drop(cache);

    let config = Config::from_env("amd64", "16")
        .unwrap()
        .with_api_base(Url::parse(&server.uri()).unwrap());
    let store: Store<TestMacaroon> = Store::new(config, cache_dir, None).await;

    let info = DownloadInfo {
        url: format!("{}/should-not-be-called", server.uri()),
        anonymous_url: None,
        sha3_384: hash,
        size: bytes.len() as u64,
        deltas: vec![],
    };
    let target = dir.path().join("out.snap");
    store
        .download(
            None,
            &info,
            &target,
            &store_client::download::DownloadOptions {
                name: "hello",
                user: None,
                leave_partial_on_error: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&target).await.unwrap(), bytes);
}

/// S2: a download resumes from a `.partial` file via a 206 range response
/// and still produces a hash-correct whole file.
#[tokio::test]
async fn s2_resume_produces_correct_whole_file() {
    let server = MockServer::start().await;
    let full: Vec<u8> = (0..64u8).collect();
    let hash = Hash::sha3_384_of_bytes(&full);
    let split = 32usize;

    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(move |req: &wiremock::Request| {
            if let Some(range) = req.headers.get("range") {
                assert_eq!(range.to_str().unwrap(), format!("bytes={split}-"));
                ResponseTemplate::new(206).set_body_bytes(full[split..].to_vec())
            } else {
                ResponseTemplate::new(200).set_body_bytes(full.clone())
            }
        })
        .mount(&server)
        .await;

    let (store, dir) = store(&server, None).await;
    let target = dir.path().join("out.snap");
    tokio::fs::write(target.with_extension("partial"), &full[..split])
        .await
        .unwrap();

    let info = DownloadInfo {
        url: format!("{}/blob", server.uri()),
        anonymous_url: None,
        sha3_384: hash,
        size: full.len() as u64,
        deltas: vec![],
    };
    store
        .download(
            None,
            &info,
            &target,
            &store_client::download::DownloadOptions {
                name: "hello",
                user: None,
                leave_partial_on_error: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&target).await.unwrap(), full);
}

/// S3: a refresh action offering the already-installed revision produces
/// no result, just a `NoUpdateAvailable`-coded refresh error.
#[tokio::test]
async fn s3_refresh_no_op_is_not_a_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/snaps/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{
                "result": "refresh",
                "instance-key": "snap-id-1",
                "snap": {
                    "name": "hello",
                    "snap-id": "snap-id-1",
                    "revision": 5,
                    "epoch": {"read": [0], "write": [0]},
                },
            }],
            "error-list": [],
        })))
        .mount(&server)
        .await;

    let (store, _dir) = store(&server, None).await;
    let current = vec![CurrentSnap::new("hello", "snap-id-1", 5).unwrap()];
    let action = SnapAction {
        kind: SnapActionKind::Refresh,
        instance_name: "hello".into(),
        snap_id: Some("snap-id-1".into()),
        channel: Some("stable".into()),
        revision: None,
        cohort_key: None,
        epoch: None,
        ignore_validation: None,
    };

    let outcome = store
        .snap_action(None, &current, &[action], store_client::snap_action::SnapActionOptions::default())
        .await
        .unwrap();
    assert!(outcome.results.is_empty());
    assert!(outcome.errors.refresh_errors.contains_key("hello"));
}

/// S4: a 401 with `needs_refresh=1` triggers exactly one discharge refresh,
/// then a retry that succeeds, updating the caller's credentials in place.
#[tokio::test]
async fn s4_401_refresh_dance_updates_credentials_in_place() {
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
        .and(path("/api/v1/snaps/purchases/customers/me"))
        .respond_with(move |_: &wiremock::Request| {
            let n = call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Macaroon needs_refresh=1")
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "has_payment_method": true,
                    "latest_tos_accepted": true,
                }))
            }
        })
        .mount(&server)
        .await;

    let auth: Arc<dyn AuthContext> = Arc::new(TestAuthContext);
    let (store, _dir) = store(&server, Some(auth)).await;

    // `refresh_user_discharges` only refreshes discharges whose location
    // matches the configured SSO host, so the fake discharge must claim
    // the mock server's own host to be picked up for refresh.
    let sso_host = Url::parse(&server.uri()).unwrap().host_str().unwrap().to_owned();
    let stale = TestMacaroon {
        id: "discharge-1".into(),
        location: Some(sso_host),
    }
    .serialize();

    let mut user = UserCredentials {
        root: "root-id".into(),
        discharges: vec![stale],
    };

    store.ready_to_buy(&mut user).await.unwrap();
    assert_eq!(user.discharges, vec!["fresh-discharge".to_owned()]);
}

/// S5: a v2 404 with an old `Snap-Store-Version` falls back to the v1 find
/// endpoint, with `category`/`common-id` renamed to `section`/`common_id`.
#[tokio::test]
async fn s5_find_falls_back_to_v1_on_old_store() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/snaps/find"))
        .respond_with(ResponseTemplate::new(404).insert_header("snap-store-version", "19"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/search"))
        .respond_with(|req: &wiremock::Request| {
            let query: std::collections::HashMap<_, _> = req.url.query_pairs().collect();
            assert_eq!(query.get("section").map(|s| s.as_ref()), Some("games"));
            assert_eq!(query.get("common_id").map(|s| s.as_ref()), Some("org.example.app"));
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/hal+json")
                .set_body_json(serde_json::json!({"_embedded": {"clickindex:package": []}}))
        })
        .mount(&server)
        .await;

    let (store, _dir) = store(&server, None).await;
    let search = store_core::api::search::Search {
        category: Some("games".into()),
        common_id: Some("org.example.app".into()),
        ..Default::default()
    };

    let results = store.find(&search).await.unwrap();
    assert!(results.is_empty());
}

/// S6: a 200 response carrying `state=Cancelled` surfaces as an error, not
/// a successful purchase.
#[tokio::test]
async fn s6_buy_cancelled_is_an_error_not_a_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/snaps/purchases/buy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Cancelled"})))
        .mount(&server)
        .await;

    let (store, _dir) = store(&server, None).await;
    let mut user = UserCredentials {
        root: "root".into(),
        discharges: vec![],
    };

    let err = store
        .buy(&mut user, "snap-id", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Other(msg) if msg.contains("cancelled")));
}
