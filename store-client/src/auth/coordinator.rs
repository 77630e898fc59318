//! `AuthCoordinator`: the login/refresh/session-exchange state machine
//! (spec.md §4.4).

use std::marker::PhantomData;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use super::{AuthContext, DeviceCredentials, Macaroon, UserCredentials};
use crate::error::from_reqwest;
use store_core::error::StoreError;
use store_core::StoreResult;

#[derive(Debug, Deserialize)]
struct RootMacaroonResponse {
    macaroon: String,
}

#[derive(Debug, Deserialize)]
struct DischargeResponse {
    discharge_macaroon: String,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    macaroon: String,
}

/// Drives the two credential layers described in spec.md §4.4. Generic over
/// the [`Macaroon`] implementation so that header construction (which must
/// bind each discharge to its root before serializing) stays decoupled from
/// any concrete crypto library.
pub struct AuthCoordinator<M: Macaroon> {
    http: HttpClient,
    store_base: Url,
    sso_base: Url,
    /// Serializes the session-nonce exchange so concurrent callers don't
    /// race to mint two session macaroons (spec.md §4.4/§9).
    device_refresh_lock: Mutex<()>,
    _macaroon: PhantomData<M>,
}

impl<M: Macaroon> AuthCoordinator<M> {
    pub fn new(http: HttpClient, store_base: Url, sso_base: Url) -> Self {
        Self {
            http,
            store_base,
            sso_base,
            device_refresh_lock: Mutex::new(()),
            _macaroon: PhantomData,
        }
    }

    /// Obtains a root macaroon from the store, extracts its SSO third-party
    /// caveat, and discharges it against the SSO with the given credentials.
    pub async fn login_user(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> StoreResult<UserCredentials> {
        let root = self.request_root_macaroon().await?;
        let macaroon = M::deserialize(&root).map_err(|_| {
            tracing::warn!("root macaroon failed to parse");
            StoreError::InvalidCredentials
        })?;

        let location = macaroon
            .third_party_location()
            .ok_or(StoreError::InvalidCredentials)?;

        let discharge = self
            .request_discharge(&location, username, password, otp)
            .await?;

        Ok(UserCredentials {
            root,
            discharges: vec![discharge],
        })
    }

    /// Refreshes every discharge bound to the SSO location, passing through
    /// discharges bound elsewhere unchanged (spec.md §4.4).
    pub async fn refresh_user_discharges(
        &self,
        user: &UserCredentials,
        auth: &dyn AuthContext,
    ) -> StoreResult<UserCredentials> {
        let sso_location = self.sso_base.host_str().unwrap_or_default().to_owned();

        let mut refreshed = Vec::with_capacity(user.discharges.len());
        for discharge in &user.discharges {
            let parsed = M::deserialize(discharge).map_err(|_| StoreError::InvalidCredentials)?;
            let needs_refresh = parsed
                .third_party_location()
                .map(|loc| loc.contains(&sso_location))
                .unwrap_or(false);

            if needs_refresh {
                refreshed.push(self.refresh_discharge(discharge).await?);
            } else {
                refreshed.push(discharge.clone());
            }
        }

        let updated = UserCredentials {
            root: user.root.clone(),
            discharges: refreshed,
        };
        auth.update_user_auth(updated.clone()).await;
        Ok(updated)
    }

    /// Returns a usable session macaroon, minting one via the nonce exchange
    /// if none is cached. Re-checks device state after acquiring the lock so
    /// a racing caller's refresh isn't duplicated (spec.md §4.4/§9).
    pub async fn ensure_device_session(&self, auth: &dyn AuthContext) -> StoreResult<String> {
        if let Some(session) = auth.device().await.session {
            return Ok(session);
        }

        let _guard = self.device_refresh_lock.lock().await;

        let device = auth.device().await;
        if let Some(session) = device.session {
            return Ok(session);
        }
        let serial = device.serial.ok_or(StoreError::NoSerial)?;

        let nonce = self.request_nonce().await?;
        let params = auth.device_session_request_params(&nonce).await;
        let session = self.exchange_session(params).await?;

        auth.update_device_auth(DeviceCredentials {
            serial: Some(serial),
            session: Some(session.clone()),
        })
        .await;

        Ok(session)
    }

    /// Builds the `Authorization`-style header value for user credentials:
    /// `Macaroon root="…", discharge="…", …`, with each discharge bound to
    /// the root's signature before serialization (spec.md §4.4).
    pub fn user_auth_header(user: &UserCredentials) -> StoreResult<String> {
        let root = M::deserialize(&user.root).map_err(|_| StoreError::InvalidCredentials)?;

        let mut parts = vec![format!("root=\"{}\"", user.root)];
        for discharge in &user.discharges {
            let parsed = M::deserialize(discharge).map_err(|_| StoreError::InvalidCredentials)?;
            let bound = parsed.bind(&root);
            parts.push(format!("discharge=\"{}\"", bound.serialize()));
        }

        Ok(format!("Macaroon {}", parts.join(", ")))
    }

    /// Builds the device-authorization header value: `Macaroon root="…"`.
    pub fn device_auth_header(session: &str) -> String {
        format!("Macaroon root=\"{session}\"")
    }

    async fn request_root_macaroon(&self) -> StoreResult<String> {
        let url = self
            .store_base
            .join("api/v1/acl/")
            .map_err(crate::error::from_url)?;

        let res = self.http.post(url).send().await.map_err(from_reqwest)?;
        if !res.status().is_success() {
            return Err(StoreError::InvalidCredentials);
        }

        let body: RootMacaroonResponse = res.json().await.map_err(from_reqwest)?;
        Ok(body.macaroon)
    }

    async fn request_discharge(
        &self,
        location: &str,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> StoreResult<String> {
        let url = self
            .sso_base
            .join("api/v2/tokens/discharge")
            .map_err(crate::error::from_url)?;

        #[derive(serde::Serialize)]
        struct Req<'a> {
            email: &'a str,
            password: &'a str,
            caveat_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            otp: Option<&'a str>,
        }

        let res = self
            .http
            .post(url)
            .json(&Req {
                email: username,
                password,
                caveat_id: location,
                otp,
            })
            .send()
            .await
            .map_err(from_reqwest)?;

        if !res.status().is_success() {
            return Err(StoreError::InvalidCredentials);
        }

        let body: DischargeResponse = res.json().await.map_err(from_reqwest)?;
        Ok(body.discharge_macaroon)
    }

    async fn refresh_discharge(&self, discharge: &str) -> StoreResult<String> {
        let url = self
            .sso_base
            .join("api/v2/tokens/refresh")
            .map_err(crate::error::from_url)?;

        #[derive(serde::Serialize)]
        struct Req<'a> {
            discharge_macaroon: &'a str,
        }

        let res = self
            .http
            .post(url)
            .json(&Req {
                discharge_macaroon: discharge,
            })
            .send()
            .await
            .map_err(from_reqwest)?;

        if !res.status().is_success() {
            return Err(StoreError::Unauthenticated);
        }

        let body: DischargeResponse = res.json().await.map_err(from_reqwest)?;
        Ok(body.discharge_macaroon)
    }

    async fn request_nonce(&self) -> StoreResult<String> {
        let url = self
            .store_base
            .join("api/v1/auth/nonces")
            .map_err(crate::error::from_url)?;

        let res = self.http.post(url).send().await.map_err(from_reqwest)?;
        if !res.status().is_success() {
            return Err(StoreError::Unauthenticated);
        }

        let body: NonceResponse = res.json().await.map_err(from_reqwest)?;
        Ok(body.nonce)
    }

    async fn exchange_session(
        &self,
        params: super::DeviceSessionRequestParams,
    ) -> StoreResult<String> {
        let url = self
            .store_base
            .join("api/v1/auth/sessions")
            .map_err(crate::error::from_url)?;

        let res = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, params.content_type)
            .body(params.body)
            .send()
            .await
            .map_err(from_reqwest)?;

        if !res.status().is_success() {
            return Err(StoreError::Unauthenticated);
        }

        let body: SessionResponse = res.json().await.map_err(from_reqwest)?;
        Ok(body.macaroon)
    }
}
