//! Discovery APIs (spec.md §4.5): `SnapInfo`, `Find` (with v1 fallback),
//! `Sections`, and the streaming `WriteCatalogs`.

use std::io::Read as _;

use futures::TryStreamExt;
use reqwest::Method;
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::auth::Macaroon;
use crate::config::Config;
use crate::http::{ApiLevel, Pipeline, RequestSpec, RetryStrategy};
use store_core::api::search::Search;
use store_core::error::StoreError;
use store_core::types::{DeltaInfo, DownloadInfo, Epoch};
use store_core::StoreResult;

/// The minimum `Snap-Store-Version` below which a v2 404 triggers the v1
/// find fallback (spec.md §4.5, scenario S5).
const MIN_V2_STORE_VERSION: u32 = 20;

#[derive(Debug, Clone)]
pub struct SnapInfo {
    pub name: String,
    pub snap_id: String,
    pub channel: String,
    pub revision: i64,
    pub version: String,
    pub confinement: String,
    pub epoch: Epoch,
    pub download: DownloadInfo,
}

#[derive(Debug, Deserialize)]
struct RawSnapInfoResponse {
    name: String,
    #[serde(rename = "snap-id")]
    snap_id: String,
    #[serde(rename = "channel-map")]
    channel_map: Vec<RawChannelMapEntry>,
}

#[derive(Debug, Deserialize)]
struct RawChannelMapEntry {
    channel: RawChannel,
    revision: i64,
    version: String,
    confinement: String,
    #[serde(default)]
    epoch: Epoch,
    download: RawDownload,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawDownload {
    url: String,
    sha3_384: store_core::Hash,
    size: u64,
    #[serde(default)]
    deltas: Vec<RawDelta>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    format: String,
    from_revision: i64,
    to_revision: i64,
    url: String,
    sha3_384: store_core::Hash,
    size: u64,
}

impl From<RawDelta> for DeltaInfo {
    fn from(raw: RawDelta) -> Self {
        Self {
            format: raw.format,
            from_revision: raw.from_revision,
            to_revision: raw.to_revision,
            url: raw.url,
            sha3_384: raw.sha3_384,
            size: raw.size,
        }
    }
}

/// `GET v2/snaps/info/{name}` (spec.md §4.5).
pub async fn snap_info<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    name: &str,
    currency_slot: &AsyncMutex<Option<String>>,
) -> StoreResult<SnapInfo> {
    let url = Config::endpoint_url(
        &config.base_url(None).await,
        &format!("v2/snaps/info/{name}"),
        &[
            ("fields", config.info_fields.join(",")),
            ("architecture", config.architecture.clone()),
        ],
    )?;
    let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V2);

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::metadata())
        .await?;

    record_suggested_currency(&res, currency_slot).await;

    match res.status().as_u16() {
        200 => {
            let raw: RawSnapInfoResponse = res.json().await.map_err(crate::error::from_reqwest)?;
            let entry = raw
                .channel_map
                .into_iter()
                .find(|e| e.channel.name == "stable")
                .ok_or_else(|| StoreError::SnapNotFound { name: name.to_owned() })?;

            Ok(SnapInfo {
                name: raw.name,
                snap_id: raw.snap_id,
                channel: entry.channel.name,
                revision: entry.revision,
                version: entry.version,
                confinement: entry.confinement,
                epoch: entry.epoch,
                download: DownloadInfo {
                    url: entry.download.url.clone(),
                    anonymous_url: Some(entry.download.url),
                    sha3_384: entry.download.sha3_384,
                    size: entry.download.size,
                    deltas: entry.download.deltas.into_iter().map(Into::into).collect(),
                },
            })
        }
        404 => Err(StoreError::SnapNotFound { name: name.to_owned() }),
        status => Err(StoreError::Other(format!("unexpected snap-info status {status}"))),
    }
}

async fn record_suggested_currency(res: &reqwest::Response, currency_slot: &AsyncMutex<Option<String>>) {
    if let Some(currency) = res
        .headers()
        .get("x-suggested-currency")
        .and_then(|v| v.to_str().ok())
    {
        *currency_slot.lock().await = Some(currency.to_owned());
    }
}

#[derive(Debug, Deserialize)]
struct FindResponseV2 {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// `Find` (spec.md §4.5): v2 search with v1 fallback on a 404 from a store
/// too old to understand v2.
pub async fn find<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    search: &Search,
    currency_slot: &AsyncMutex<Option<String>>,
) -> StoreResult<Vec<serde_json::Value>> {
    search.validate()?;

    let params = search.to_v2_params(config.classic);
    let query: Vec<(&str, String)> = params.into_iter().collect();
    let url = Config::endpoint_url(&config.base_url(None).await, "v2/snaps/find", &query)?;
    let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V2);

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::metadata())
        .await?;

    record_suggested_currency(&res, currency_slot).await;

    if res.status().as_u16() == 404 {
        let store_version: u32 = res
            .headers()
            .get("snap-store-version")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(u32::MAX);

        if store_version < MIN_V2_STORE_VERSION {
            return find_v1(pipeline, config, search, currency_slot).await;
        }
        return Err(StoreError::Other("find: not found".into()));
    }

    if !res.status().is_success() {
        return Err(StoreError::Other(format!(
            "unexpected find status {}",
            res.status()
        )));
    }

    let content_type = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if !content_type.starts_with("application/json") {
        return Err(StoreError::MalformedResponse(format!(
            "unexpected content-type {content_type}"
        )));
    }

    let body: FindResponseV2 = res.json().await.map_err(crate::error::from_reqwest)?;
    Ok(body.results)
}

async fn find_v1<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    search: &Search,
    currency_slot: &AsyncMutex<Option<String>>,
) -> StoreResult<Vec<serde_json::Value>> {
    let params = search.to_v1_params(config.classic);
    let query: Vec<(&str, String)> = params.into_iter().collect();
    let url = Config::endpoint_url(&config.base_url(None).await, "api/v1/snaps/search", &query)?;
    let spec = RequestSpec::new(Method::GET, url, "application/hal+json", ApiLevel::V1);

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::metadata())
        .await?;
    record_suggested_currency(&res, currency_slot).await;

    if !res.status().is_success() {
        return Err(StoreError::Other(format!(
            "unexpected v1 search status {}",
            res.status()
        )));
    }

    #[derive(Debug, Deserialize)]
    struct V1Response {
        #[serde(rename = "_embedded", default)]
        embedded: V1Embedded,
    }
    #[derive(Debug, Default, Deserialize)]
    struct V1Embedded {
        #[serde(rename = "clickindex:package", default)]
        packages: Vec<serde_json::Value>,
    }

    let body: V1Response = res.json().await.map_err(crate::error::from_reqwest)?;
    Ok(body.embedded.packages)
}

#[derive(Debug, Deserialize)]
struct SectionsResponse {
    #[serde(rename = "_embedded", default)]
    embedded: SectionsEmbedded,
}
#[derive(Debug, Default, Deserialize)]
struct SectionsEmbedded {
    #[serde(rename = "clickindex:sections", default)]
    sections: Vec<SectionEntry>,
}
#[derive(Debug, Deserialize)]
struct SectionEntry {
    name: String,
}

/// `Sections`: section names from the sections endpoint.
pub async fn sections<M: Macaroon>(pipeline: &Pipeline<M>, config: &Config) -> StoreResult<Vec<String>> {
    let url = Config::endpoint_url(&config.base_url(None).await, "api/v1/snaps/sections", &[])?;
    let spec = RequestSpec::new(Method::GET, url, "application/hal+json", ApiLevel::V1);

    let res = pipeline
        .send_with_auth(&spec, None, &RetryStrategy::metadata())
        .await?;

    if !res.status().is_success() {
        return Err(StoreError::Other(format!(
            "unexpected sections status {}",
            res.status()
        )));
    }

    let body: SectionsResponse = res.json().await.map_err(crate::error::from_reqwest)?;
    Ok(body.embedded.sections.into_iter().map(|s| s.name).collect())
}

/// Receives names discovered while streaming the catalog: plain package
/// names go to the `writer` passed to [`write_catalogs`], while alias names
/// and fully-qualified `snap.app` names go here (spec.md §4.5).
///
/// Implemented as a synchronous trait (rather than `async_trait`) because
/// it is driven from inside the blocking thread that parses the catalog
/// response; an async sink would need to re-enter the runtime mid-parse.
pub trait SnapAdder: Send {
    fn add_name(&mut self, name: &str) -> std::io::Result<()>;
}

#[derive(Debug, Deserialize)]
struct CatalogPackageEntry {
    package_name: String,
    #[serde(default)]
    apps: Vec<CatalogAppEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogAppEntry {
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
}

struct TopVisitor<'a, W, A> {
    writer: &'a mut W,
    adder: &'a mut A,
}

impl<'de, 'a, W: std::io::Write, A: SnapAdder> Visitor<'de> for TopVisitor<'a, W, A> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a catalog object with an `_embedded` field")
    }

    fn visit_map<Map>(self, mut map: Map) -> Result<(), Map::Error>
    where
        Map: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            if key == "_embedded" {
                map.next_value_seed(EmbeddedSeed {
                    writer: self.writer,
                    adder: self.adder,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct EmbeddedSeed<'a, W, A> {
    writer: &'a mut W,
    adder: &'a mut A,
}

impl<'de, 'a, W: std::io::Write, A: SnapAdder> DeserializeSeed<'de> for EmbeddedSeed<'a, W, A> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(EmbeddedVisitor {
            writer: self.writer,
            adder: self.adder,
        })
    }
}

struct EmbeddedVisitor<'a, W, A> {
    writer: &'a mut W,
    adder: &'a mut A,
}

impl<'de, 'a, W: std::io::Write, A: SnapAdder> Visitor<'de> for EmbeddedVisitor<'a, W, A> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("an object with a `clickindex:package` array")
    }

    fn visit_map<Map>(self, mut map: Map) -> Result<(), Map::Error>
    where
        Map: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            if key == "clickindex:package" {
                map.next_value_seed(PackagesSeed {
                    writer: self.writer,
                    adder: self.adder,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct PackagesSeed<'a, W, A> {
    writer: &'a mut W,
    adder: &'a mut A,
}

impl<'de, 'a, W: std::io::Write, A: SnapAdder> DeserializeSeed<'de> for PackagesSeed<'a, W, A> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(PackagesVisitor {
            writer: self.writer,
            adder: self.adder,
        })
    }
}

struct PackagesVisitor<'a, W, A> {
    writer: &'a mut W,
    adder: &'a mut A,
}

impl<'de, 'a, W: std::io::Write, A: SnapAdder> Visitor<'de> for PackagesVisitor<'a, W, A> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a sequence of package entries")
    }

    fn visit_seq<Seq>(self, mut seq: Seq) -> Result<(), Seq::Error>
    where
        Seq: SeqAccess<'de>,
    {
        while let Some(entry) = seq.next_element::<CatalogPackageEntry>()? {
            self.writer
                .write_all(entry.package_name.as_bytes())
                .and_then(|_| self.writer.write_all(b"\n"))
                .map_err(serde::de::Error::custom)?;

            for app in &entry.apps {
                let qualified = format!("{}.{}", entry.package_name, app.name);
                for alias in &app.aliases {
                    self.adder.add_name(alias).map_err(serde::de::Error::custom)?;
                }
                self.adder
                    .add_name(&qualified)
                    .map_err(serde::de::Error::custom)?;
            }
        }
        Ok(())
    }
}

fn decode_catalog_blocking(
    reader: impl std::io::Read,
    mut writer: impl std::io::Write,
    mut adder: impl SnapAdder,
) -> StoreResult<()> {
    let mut de = serde_json::Deserializer::from_reader(reader);
    let visitor = TopVisitor {
        writer: &mut writer,
        adder: &mut adder,
    };
    serde::Deserializer::deserialize_map(&mut de, visitor)
        .map_err(|e| StoreError::MalformedResponse(e.to_string()))
}

/// Streams the (potentially huge) catalog response without buffering it
/// whole: the HTTP body is bridged into a synchronous reader and parsed
/// token-by-token on a blocking task (spec.md §4.5/§9). Unauthenticated, so
/// it bypasses the auth pipeline entirely rather than taking a `Pipeline`.
pub async fn write_catalogs(
    config: &Config,
    writer: impl std::io::Write + Send + 'static,
    adder: impl SnapAdder + 'static,
) -> StoreResult<()> {
    // A dedicated client, distinct from the metadata pipeline's, so this
    // very large response is never pulled through any body-logging layer.
    let http = reqwest::Client::builder()
        .build()
        .map_err(crate::error::from_reqwest)?;

    let url = Config::endpoint_url(&config.base_url(None).await, "api/v1/snaps/names", &[])?;
    let res = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/hal+json")
        .send()
        .await
        .map_err(crate::error::from_reqwest)?;

    if !res.status().is_success() {
        return Err(StoreError::Other(format!(
            "unexpected catalog status {}",
            res.status()
        )));
    }

    let stream = res
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let async_reader = StreamReader::new(stream);
    let sync_reader = SyncIoBridge::new(async_reader);

    tokio::task::spawn_blocking(move || decode_catalog_blocking(sync_reader, writer, adder))
        .await
        .map_err(|e| StoreError::Other(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fakes::FakeMacaroon;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct VecAdder(Vec<String>);
    impl SnapAdder for VecAdder {
        fn add_name(&mut self, name: &str) -> std::io::Result<()> {
            self.0.push(name.to_owned());
            Ok(())
        }
    }

    #[test]
    fn decode_catalog_extracts_names_and_aliases() {
        let json = r#"{
            "_embedded": {
                "clickindex:package": [
                    {"package_name": "hello", "apps": [{"name": "hello", "aliases": ["hi"]}]},
                    {"package_name": "world"}
                ]
            }
        }"#;

        let mut writer = Vec::new();
        let mut adder = VecAdder(Vec::new());
        decode_catalog_blocking(json.as_bytes(), &mut writer, &mut adder).unwrap();

        assert_eq!(String::from_utf8(writer).unwrap(), "hello\nworld\n");
        assert_eq!(adder.0, vec!["hi".to_owned(), "hello.hello".to_owned()]);
    }

    #[tokio::test]
    async fn find_falls_back_to_v1_on_old_store_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/snaps/find"))
            .respond_with(ResponseTemplate::new(404).insert_header("snap-store-version", "19"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/snaps/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": {"clickindex:package": [{"package_name": "hello"}]}
            })))
            .mount(&server)
            .await;

        let config = Config::from_env("amd64", "16")
            .unwrap()
            .with_api_base(url::Url::parse(&server.uri()).unwrap());
        let pipeline: Pipeline<FakeMacaroon> =
            Pipeline::new(reqwest::Client::new(), Arc::new(config.clone()), None, None);
        let currency_slot = AsyncMutex::new(None);

        let search = Search {
            query: Some("hello".to_owned()),
            ..Default::default()
        };
        let results = find(&pipeline, &config, &search, &currency_slot).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn snap_info_picks_stable_channel_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/snaps/info/hello"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-suggested-currency", "EUR")
                    .set_body_json(serde_json::json!({
                        "name": "hello",
                        "snap-id": "snap-id-1",
                        "channel-map": [{
                            "channel": {"name": "stable"},
                            "revision": 42,
                            "version": "1.2.3",
                            "confinement": "strict",
                            "download": {
                                "url": "https://cdn.example.com/hello_42.snap",
                                "sha3_384": "a".repeat(96),
                                "size": 1024,
                            },
                        }],
                    })),
            )
            .mount(&server)
            .await;

        let config = Config::from_env("amd64", "16")
            .unwrap()
            .with_api_base(url::Url::parse(&server.uri()).unwrap());
        let pipeline: Pipeline<FakeMacaroon> =
            Pipeline::new(reqwest::Client::new(), Arc::new(config.clone()), None, None);
        let currency_slot = AsyncMutex::new(None);

        let info = snap_info(&pipeline, &config, "hello", &currency_slot).await.unwrap();
        assert_eq!(info.revision, 42);
        assert_eq!(info.channel, "stable");
        assert_eq!(*currency_slot.lock().await, Some("EUR".to_owned()));
    }

    #[tokio::test]
    async fn write_catalogs_streams_names_without_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/snaps/names"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": {"clickindex:package": [{"package_name": "hello"}]}
            })))
            .mount(&server)
            .await;

        let config = Config::from_env("amd64", "16")
            .unwrap()
            .with_api_base(url::Url::parse(&server.uri()).unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.txt");
        let file = std::fs::File::create(&path).unwrap();
        write_catalogs(&config, file, VecAdder(Vec::new())).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn sections_parses_section_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/snaps/sections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": {"clickindex:sections": [{"name": "games"}, {"name": "tools"}]}
            })))
            .mount(&server)
            .await;

        let config = Config::from_env("amd64", "16")
            .unwrap()
            .with_api_base(url::Url::parse(&server.uri()).unwrap());
        let pipeline: Pipeline<FakeMacaroon> =
            Pipeline::new(reqwest::Client::new(), Arc::new(config.clone()), None, None);

        let names = sections(&pipeline, &config).await.unwrap();
        assert_eq!(names, vec!["games".to_owned(), "tools".to_owned()]);
    }
}
