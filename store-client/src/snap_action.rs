//! The batched install/refresh/download protocol (spec.md §4.6):
//! `POST v2/snaps/refresh`.

use std::collections::HashMap;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;

use crate::auth::{Macaroon, UserCredentials};
use crate::config::Config;
use crate::http::{ApiLevel, Pipeline, RequestSpec, RetryStrategy};
use store_core::api::snap_action::{
    ActionEntry, ContextEntry, ResultKind, SnapActionRequestBody, SnapActionResponseBody,
};
use store_core::error::{SnapActionError, SnapActionErrorDetail};
use store_core::types::{CurrentSnap, DownloadInfo, SnapAction, SnapActionKind, SnapActionResult};
use store_core::StoreResult;

/// A fixed salt for instance-key derivation (spec.md §4.6, testable property
/// #5): the crate has no access to a system-level secret, so the salt is a
/// constant rather than per-install entropy. Recorded as an open decision.
const INSTANCE_KEY_SALT: &[u8] = b"store-client-instance-key";

/// Per-batch flags that change which headers ride along with the request
/// (spec.md §4.6): whether this is an unattended scheduled refresh, and
/// whether refresh is managed by a separate snap rather than the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapActionOptions {
    pub auto_refresh: bool,
    pub managed: bool,
}

/// The outcome of one batch: per-item successes plus the bucketed errors a
/// caller needs to act on (spec.md §4.6).
#[derive(Debug, Default)]
pub struct SnapActionOutcome {
    pub results: Vec<SnapActionResult>,
    pub errors: SnapActionError,
}

impl SnapActionOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs one install/refresh/download batch, retrying up to twice if the
/// server reports a soft-expired credential (spec.md §4.6, §7): a single
/// batch response can signal `user-authorization-needs-refresh` or
/// `device-authorization-needs-refresh` in its error list without ever
/// returning an HTTP 401, so this sits above the pipeline's own 401 dance.
pub async fn snap_action<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    mut user: Option<&mut UserCredentials>,
    current: &[CurrentSnap],
    actions: &[SnapAction],
    options: SnapActionOptions,
) -> StoreResult<SnapActionOutcome> {
    const MAX_SOFT_EXPIRY_RETRIES: u32 = 2;

    let mut attempt = 0;
    loop {
        let outcome = send_batch(pipeline, config, user.as_deref_mut(), current, actions, options).await?;

        let need = outcome.errors.needs_auth_refresh();
        if !need.any() || attempt >= MAX_SOFT_EXPIRY_RETRIES {
            return Ok(outcome);
        }

        pipeline.force_refresh(user.as_deref_mut(), need).await?;

        attempt += 1;
        tracing::debug!(attempt, "snap-action batch reported soft-expired credentials, retrying");
    }
}

async fn send_batch<M: Macaroon>(
    pipeline: &Pipeline<M>,
    config: &Config,
    user: Option<&mut UserCredentials>,
    current: &[CurrentSnap],
    actions: &[SnapAction],
    options: SnapActionOptions,
) -> StoreResult<SnapActionOutcome> {
    let mut key_by_instance = HashMap::new();
    let context: Vec<ContextEntry> = current
        .iter()
        .map(|snap| {
            let key = store_core::instance_key::derive(&snap.snap_id, snap.instance_key_part(), INSTANCE_KEY_SALT);
            key_by_instance.insert(snap.instance_name.clone(), key.clone());
            ContextEntry {
                instance_key: key,
                snap_id: snap.snap_id.clone(),
                revision: snap.revision,
                tracking_channel: snap.tracking_channel.clone(),
                epoch: snap.epoch.clone(),
                refresh_date: snap.refresh_date.clone(),
                cohort_key: snap.cohort_key.clone(),
                ignore_validation: Some(snap.ignore_validation),
            }
        })
        .collect();

    let mut action_index: HashMap<String, (String, SnapActionKind)> = HashMap::new();
    let action_entries: Vec<ActionEntry> = actions
        .iter()
        .cloned()
        .map(SnapAction::normalized)
        .enumerate()
        .map(|(index, action)| {
            let instance_key = match action.kind {
                SnapActionKind::Refresh => key_by_instance
                    .get(&action.instance_name)
                    .cloned()
                    .unwrap_or_else(|| store_core::instance_key::synthetic("refresh", index)),
                SnapActionKind::Install => store_core::instance_key::synthetic("install", index),
                SnapActionKind::Download => store_core::instance_key::synthetic("download", index),
            };
            action_index.insert(instance_key.clone(), (action.instance_name.clone(), action.kind));

            let action_name = match action.kind {
                SnapActionKind::Install => "install",
                SnapActionKind::Refresh => "refresh",
                SnapActionKind::Download => "download",
            };

            // Zero/absent epoch still serializes as an explicit `null` for
            // install/download, to signal epoch-awareness; refresh omits
            // the field entirely (spec.md §4.6, testable property #8).
            let epoch = match action.kind {
                SnapActionKind::Refresh => None,
                SnapActionKind::Install | SnapActionKind::Download => {
                    Some(action.epoch.clone().filter(|e| !e.is_zero()))
                }
            };

            ActionEntry {
                action: action_name,
                instance_key,
                name: if action.kind == SnapActionKind::Refresh {
                    None
                } else {
                    Some(action.instance_name.clone())
                },
                snap_id: action.snap_id.clone(),
                channel: action.channel.clone(),
                revision: action.revision,
                cohort_key: action.cohort_key.clone(),
                epoch,
                ignore_validation: action.ignore_validation,
            }
        })
        .collect();

    let body = SnapActionRequestBody {
        context,
        actions: action_entries,
        fields: config.info_fields.clone(),
    };
    let payload = serde_json::to_vec(&body).map_err(crate::error::from_json)?;

    let url = Config::endpoint_url(&config.base_url(None).await, "v2/snaps/refresh", &[])?;
    let mut spec = RequestSpec::new(Method::POST, url, "application/json", ApiLevel::V2).with_json_body(payload);

    if options.auto_refresh {
        spec = spec.with_header(
            HeaderName::from_static("snap-refresh-reason"),
            HeaderValue::from_static("scheduled"),
        );
    }
    if let Some(format) = config.delta_format {
        spec = spec.with_header(
            HeaderName::from_static("snap-accept-delta-format"),
            HeaderValue::from_static(format.as_str()),
        );
    }
    if options.managed {
        spec = spec.with_header(
            HeaderName::from_static("snap-refresh-managed"),
            HeaderValue::from_static("true"),
        );
    }

    let res = pipeline
        .send_with_auth(&spec, user, &RetryStrategy::metadata())
        .await?;

    if !res.status().is_success() {
        return Err(store_core::StoreError::Other(format!(
            "unexpected snap-action status {}",
            res.status()
        )));
    }

    let body: SnapActionResponseBody = res.json().await.map_err(crate::error::from_reqwest)?;
    let current_by_name: HashMap<&str, &CurrentSnap> =
        current.iter().map(|snap| (snap.instance_name.as_str(), snap)).collect();
    Ok(partition(body, &action_index, &current_by_name))
}

fn partition(
    body: SnapActionResponseBody,
    action_index: &HashMap<String, (String, SnapActionKind)>,
    current_by_name: &HashMap<&str, &CurrentSnap>,
) -> SnapActionOutcome {
    let mut outcome = SnapActionOutcome::default();
    outcome.errors.no_results = body.results.is_empty();

    for entry in body.results {
        let correlated = entry.instance_key.as_deref().and_then(|key| action_index.get(key));
        let instance_name = correlated
            .map(|(name, _)| name.clone())
            .or_else(|| entry.name.clone())
            .unwrap_or_default();

        match entry.result {
            ResultKind::Error => {
                let Some(error) = entry.error else { continue };
                let detail = SnapActionErrorDetail {
                    code: error.code,
                    message: error.message,
                    releases: error.releases,
                };

                match correlated {
                    Some((name, SnapActionKind::Refresh)) => {
                        outcome.errors.refresh_errors.insert(name.clone(), detail);
                    }
                    Some((name, SnapActionKind::Install)) => {
                        outcome.errors.install_errors.insert(name.clone(), detail);
                    }
                    Some((name, SnapActionKind::Download)) => {
                        outcome.errors.download_errors.insert(name.clone(), detail);
                    }
                    None => outcome.errors.other_errors.push(detail),
                }
            }
            ResultKind::Refresh => {
                let Some(snap) = entry.snap else { continue };

                // A refresh offering the already-installed revision (or one
                // the caller blocked) is a no-op, not a successful result
                // (spec.md §4.6, testable property S3).
                if let Some(current) = current_by_name.get(instance_name.as_str()) {
                    if snap.revision == current.revision || current.block.contains(&snap.revision) {
                        outcome.errors.refresh_errors.insert(
                            instance_name,
                            SnapActionErrorDetail {
                                code: "no-update-available".into(),
                                message: format!("no update available for \"{}\"", snap.name),
                                releases: Vec::new(),
                            },
                        );
                        continue;
                    }
                }

                let download = snap.download.map(|d| DownloadInfo {
                    url: d.url,
                    anonymous_url: d.anonymous_url,
                    sha3_384: d.sha3_384,
                    size: d.size,
                    deltas: d
                        .deltas
                        .into_iter()
                        .map(|delta| store_core::types::DeltaInfo {
                            format: delta.format,
                            from_revision: delta.from_revision,
                            to_revision: delta.to_revision,
                            url: delta.url,
                            sha3_384: delta.sha3_384,
                            size: delta.size,
                        })
                        .collect(),
                });

                outcome.results.push(SnapActionResult {
                    instance_name,
                    snap_id: snap.snap_id,
                    name: snap.name,
                    revision: snap.revision,
                    channel: entry.effective_channel,
                    redirect_channel: entry.redirect_channel,
                    epoch: snap.epoch,
                    download,
                });
            }
            ResultKind::Install | ResultKind::Download => {
                let Some(snap) = entry.snap else { continue };
                let download = snap.download.map(|d| DownloadInfo {
                    url: d.url,
                    anonymous_url: d.anonymous_url,
                    sha3_384: d.sha3_384,
                    size: d.size,
                    deltas: d
                        .deltas
                        .into_iter()
                        .map(|delta| store_core::types::DeltaInfo {
                            format: delta.format,
                            from_revision: delta.from_revision,
                            to_revision: delta.to_revision,
                            url: delta.url,
                            sha3_384: delta.sha3_384,
                            size: delta.size,
                        })
                        .collect(),
                });

                outcome.results.push(SnapActionResult {
                    instance_name,
                    snap_id: snap.snap_id,
                    name: snap.name,
                    revision: snap.revision,
                    channel: entry.effective_channel,
                    redirect_channel: entry.redirect_channel,
                    epoch: snap.epoch,
                    download,
                });
            }
        }
    }

    for error in body.error_list {
        outcome.errors.other_errors.push(SnapActionErrorDetail {
            code: error.code,
            message: error.message,
            releases: Vec::new(),
        });
    }

    outcome
}
