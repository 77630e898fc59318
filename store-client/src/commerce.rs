//! Commerce & cohorts (spec.md §4.9): buy, ready-to-buy, and cohort
//! creation.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::auth::{Macaroon, UserCredentials};
use crate::config::Config;
use crate::http::{ApiLevel, Pipeline, RequestSpec, RetryStrategy};
use store_core::error::StoreError;
use store_core::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
enum OrderState {
    Complete,
    Cancelled,
    Pending,
}

#[derive(Debug, Serialize)]
struct BuyRequest<'a> {
    snap_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    currency: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BuyResponse {
    state: OrderState,
}

#[derive(Debug, Deserialize)]
struct BuyErrorBody {
    error_code: Option<String>,
}

/// Places an order for `snap_id`. A `Cancelled` order state surfaces as an
/// error rather than success (spec.md §8, scenario S6).
pub async fn buy<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    user: &mut UserCredentials,
    snap_id: &str,
    price: Option<f64>,
    currency: Option<&str>,
) -> StoreResult<()> {
    let url = Config::endpoint_url(&config.base_url(None).await, "api/v1/snaps/purchases/buy", &[])?;
    let body = serde_json::to_vec(&BuyRequest {
        snap_id,
        price,
        currency,
    })
    .map_err(crate::error::from_json)?;

    let spec = RequestSpec::new(Method::POST, url, "application/json", ApiLevel::V1).with_json_body(body);

    let res = pipeline
        .send_with_auth(&spec, Some(user), &RetryStrategy::metadata())
        .await?;

    match res.status() {
        StatusCode::OK | StatusCode::CREATED => {
            let body: BuyResponse = res.json().await.map_err(crate::error::from_reqwest)?;
            match body.state {
                OrderState::Cancelled => Err(StoreError::Other("payment cancelled".into())),
                OrderState::Complete | OrderState::Pending => Ok(()),
            }
        }
        StatusCode::BAD_REQUEST => Err(StoreError::Other("bad buy request".into())),
        StatusCode::FORBIDDEN => {
            let body: BuyErrorBody = res.json().await.unwrap_or(BuyErrorBody { error_code: None });
            match body.error_code.as_deref() {
                Some("no-payment-methods") => Err(StoreError::NoPaymentMethods),
                Some("tos-not-accepted") => Err(StoreError::TosNotAccepted),
                _ => Err(StoreError::Other("permission denied".into())),
            }
        }
        StatusCode::NOT_FOUND => Err(StoreError::SnapNotFound {
            name: snap_id.to_owned(),
        }),
        StatusCode::PAYMENT_REQUIRED => Err(StoreError::PaymentDeclined {
            name: snap_id.to_owned(),
        }),
        StatusCode::UNAUTHORIZED => Err(StoreError::InvalidCredentials),
        status => Err(StoreError::Other(format!("unexpected buy status {status}"))),
    }
}

#[derive(Debug, Deserialize)]
struct CustomerProfile {
    has_payment_method: bool,
    latest_tos_accepted: bool,
}

/// Checks whether the current user can make a purchase.
pub async fn ready_to_buy<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    user: &mut UserCredentials,
) -> StoreResult<()> {
    let url = Config::endpoint_url(
        &config.base_url(None).await,
        "api/v1/snaps/purchases/customers/me",
        &[],
    )?;
    let spec = RequestSpec::new(Method::GET, url, "application/json", ApiLevel::V1);

    let res = pipeline
        .send_with_auth(&spec, Some(user), &RetryStrategy::metadata())
        .await?;

    match res.status() {
        StatusCode::OK => {
            let profile: CustomerProfile = res.json().await.map_err(crate::error::from_reqwest)?;
            if !profile.has_payment_method {
                Err(StoreError::NoPaymentMethods)
            } else if !profile.latest_tos_accepted {
                Err(StoreError::TosNotAccepted)
            } else {
                Ok(())
            }
        }
        StatusCode::NOT_FOUND => Err(StoreError::Other("no commerce account".into())),
        StatusCode::UNAUTHORIZED => Err(StoreError::InvalidCredentials),
        status => Err(StoreError::Other(format!(
            "unexpected ready-to-buy status {status}"
        ))),
    }
}

#[derive(Debug, Serialize)]
struct CreateCohortsRequest<'a> {
    snaps: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CreateCohortsResponse {
    #[serde(rename = "cohort-keys")]
    cohort_keys: HashMap<String, String>,
}

/// Creates cohort keys for the given snap names.
pub async fn create_cohorts<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    user: Option<&mut UserCredentials>,
    snaps: &[String],
) -> StoreResult<HashMap<String, String>> {
    let url = Config::endpoint_url(&config.base_url(None).await, "v2/cohorts", &[])?;
    let body = serde_json::to_vec(&CreateCohortsRequest { snaps }).map_err(crate::error::from_json)?;
    let spec = RequestSpec::new(Method::POST, url, "application/json", ApiLevel::V2).with_json_body(body);

    let res = pipeline
        .send_with_auth(&spec, user, &RetryStrategy::metadata())
        .await?;

    match res.status() {
        StatusCode::OK => {
            let body: CreateCohortsResponse = res.json().await.map_err(crate::error::from_reqwest)?;
            Ok(body.cohort_keys)
        }
        StatusCode::NOT_FOUND => Err(StoreError::SnapNotFound {
            name: snaps.first().cloned().unwrap_or_default(),
        }),
        status => Err(StoreError::Other(format!(
            "unexpected create-cohorts status {status}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fakes::FakeMacaroon;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline_and_config(server: &MockServer) -> (Pipeline<FakeMacaroon>, Config) {
        let config = Config::from_env("amd64", "16")
            .unwrap()
            .with_api_base(url::Url::parse(&server.uri()).unwrap());
        let pipeline = Pipeline::new(reqwest::Client::new(), Arc::new(config.clone()), None, None);
        (pipeline, config)
    }

    #[tokio::test]
    async fn buy_cancelled_state_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/snaps/purchases/buy"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Cancelled"})),
            )
            .mount(&server)
            .await;

        let (pipeline, config) = pipeline_and_config(&server);
        let mut user = UserCredentials {
            root: "root".into(),
            discharges: vec![],
        };

        let err = buy(&pipeline, &config, &mut user, "snap-id", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(msg) if msg.contains("cancelled")));
    }

    #[tokio::test]
    async fn ready_to_buy_flags_missing_payment_method() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/snaps/purchases/customers/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "has_payment_method": false,
                "latest_tos_accepted": true,
            })))
            .mount(&server)
            .await;

        let (pipeline, config) = pipeline_and_config(&server);
        let mut user = UserCredentials {
            root: "root".into(),
            discharges: vec![],
        };

        let err = ready_to_buy(&pipeline, &config, &mut user).await.unwrap_err();
        assert!(matches!(err, StoreError::NoPaymentMethods));
    }

    #[tokio::test]
    async fn create_cohorts_returns_keys() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/cohorts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cohort-keys": {"hello": "cohort-abc"}
            })))
            .mount(&server)
            .await;

        let (pipeline, config) = pipeline_and_config(&server);
        let keys = create_cohorts(&pipeline, &config, None, &["hello".to_owned()])
            .await
            .unwrap();
        assert_eq!(keys.get("hello"), Some(&"cohort-abc".to_owned()));
    }
}
