// Copyright Materialize, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The sidecar HTTP surface.
//!
//! Application servers talk to these endpoints; each handler is a thin
//! projection over the engines: parse the query or body, invoke, map errors
//! to the stable `{status, code, message}` envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info};

use crate::control::schedule::{OrgInfo, Phase};
use crate::control::Tier;
use crate::error::Error;
use crate::refs::{FeaturePlan, Name, Plan};
use crate::sidecar::model::Model;

pub mod model;

/// Builds the sidecar router over a shared control-plane handle.
pub fn router(tier: Arc<Tier>) -> Router {
    Router::new()
        .route("/v1/push", post(push))
        .route("/v1/pull", get(pull))
        .route("/v1/subscribe", post(subscribe))
        .route("/v1/phase", get(phase))
        .route("/v1/limits", get(limits))
        .route("/v1/report", post(report))
        .route("/v1/whois", get(whois))
        .route("/v1/whoami", get(whoami))
        .with_state(tier)
}

/// Binds and serves the sidecar until the server errors.
pub async fn serve(tier: Arc<Tier>, addr: SocketAddr) -> Result<(), hyper::Error> {
    info!(%addr, "sidecar listening");
    axum::Server::bind(&addr)
        .serve(router(tier).into_make_service())
        .await
}

/// The wire error envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

struct Failure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl Failure {
    fn not_found() -> Failure {
        Failure {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "not found".into(),
        }
    }

    fn invalid_org() -> Failure {
        Failure {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request",
            message: "org must be prefixed with \"org:\"".into(),
        }
    }
}

impl From<Error> for Failure {
    fn from(e: Error) -> Failure {
        let (status, code, message) = match &e {
            Error::OrgNotFound => (StatusCode::BAD_REQUEST, "org_not_found", "org not found".into()),
            Error::FeatureNotFound => (
                StatusCode::BAD_REQUEST,
                "feature_not_found",
                "feature not found".into(),
            ),
            Error::FeatureNotMetered => (
                StatusCode::BAD_REQUEST,
                "feature_not_metered",
                "feature not reportable".into(),
            ),
            Error::InvalidEmail => (StatusCode::BAD_REQUEST, "invalid_email", e.to_string()),
            Error::InvalidMetadata => (StatusCode::BAD_REQUEST, "invalid_metadata", e.to_string()),
            Error::TooManyItems => (StatusCode::BAD_REQUEST, "too_many_items", e.to_string()),
            Error::InvalidPhase => (StatusCode::BAD_REQUEST, "invalid_phase", e.to_string()),
            Error::InvalidFeature | Error::InvalidReference(_) | Error::Conflict(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
            }
            Error::InvalidApiKey => (StatusCode::UNAUTHORIZED, "invalid_api_key", e.to_string()),
            Error::Transport(_) | Error::Provider(_) => {
                error!("provider failure: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".into(),
                )
            }
        };
        Failure {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiError {
                status: self.status.as_u16(),
                code: self.code.into(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, Failure>;

#[derive(Debug, Default, Deserialize)]
struct OrgQuery {
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    include: Option<String>,
}

fn checked_org(org: Option<&str>) -> Result<&str, Failure> {
    match org {
        Some(org) if org.strip_prefix("org:").map_or(false, |rest| !rest.is_empty()) => Ok(org),
        _ => Err(Failure::invalid_org()),
    }
}

/// An empty JSON object response.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmptyResponse {}

/// The per-feature outcome of a push.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushResult {
    pub feature: FeaturePlan,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// The response to a push.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

async fn push(State(tier): State<Arc<Tier>>, Json(model): Json<Model>) -> ApiResult<PushResponse> {
    let features = model.to_features();
    let mut results = Vec::with_capacity(features.len());
    tier.push(&features, |f, outcome| {
        results.push(match outcome {
            Ok(_) => PushResult {
                feature: f.feature_plan.clone(),
                status: "ok".into(),
                reason: String::new(),
            },
            Err(e) => PushResult {
                feature: f.feature_plan.clone(),
                status: "failed".into(),
                reason: e.to_string(),
            },
        });
    })
    .await;
    Ok(Json(PushResponse { results }))
}

async fn pull(State(tier): State<Arc<Tier>>) -> ApiResult<Model> {
    let features = tier.pull().await.map_err(Failure::from)?;
    Ok(Json(Model::from_features(&features)))
}

/// One phase of a subscribe request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribePhase {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub effective: Option<OffsetDateTime>,
    #[serde(default)]
    pub features: Vec<FeaturePlan>,
}

/// A subscribe request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub org: String,
    #[serde(default)]
    pub info: Option<OrgInfo>,
    #[serde(default)]
    pub phases: Vec<SubscribePhase>,
}

async fn subscribe(
    State(tier): State<Arc<Tier>>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<EmptyResponse> {
    let org = checked_org(Some(req.org.as_str()))?;
    let now = tier.provider_now().await.map_err(Failure::from)?;
    let phases: Vec<Phase> = req
        .phases
        .into_iter()
        .map(|p| Phase::new(p.effective.unwrap_or(now), p.features))
        .collect();
    tier.schedule_append(org, req.info.as_ref(), &phases)
        .await
        .map_err(Failure::from)?;
    Ok(Json(EmptyResponse {}))
}

/// The response to a phase lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhaseResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub effective: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<OffsetDateTime>,
    pub features: Vec<FeaturePlan>,
    pub plans: Vec<Plan>,
    pub fragments: Vec<FeaturePlan>,
}

impl From<Phase> for PhaseResponse {
    fn from(p: Phase) -> PhaseResponse {
        PhaseResponse {
            effective: p.effective,
            end: p.end,
            features: p.features,
            plans: p.plans,
            fragments: p.fragments,
        }
    }
}

async fn phase(State(tier): State<Arc<Tier>>, Query(q): Query<OrgQuery>) -> ApiResult<PhaseResponse> {
    let Some(org) = q.org.as_deref() else {
        return Err(Failure::not_found());
    };
    let org = checked_org(Some(org))?;
    let phases = tier.lookup_phases(org).await.map_err(Failure::from)?;
    let current = phases
        .into_iter()
        .find(|p| p.current)
        .ok_or_else(Failure::not_found)?;
    Ok(Json(current.into()))
}

/// One entry of a limits response.
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageEntry {
    pub feature: FeaturePlan,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub used: i64,
    pub limit: i64,
}

/// The response to a limits lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub org: String,
    pub usage: Vec<UsageEntry>,
}

async fn limits(State(tier): State<Arc<Tier>>, Query(q): Query<OrgQuery>) -> ApiResult<UsageResponse> {
    let org = checked_org(q.org.as_deref())?;
    let usage = tier.lookup_limits(org).await.map_err(Failure::from)?;
    Ok(Json(UsageResponse {
        org: org.into(),
        usage: usage
            .into_iter()
            .map(|u| UsageEntry {
                feature: u.feature_plan,
                start: u.start,
                end: u.end,
                used: u.used,
                limit: u.limit,
            })
            .collect(),
    }))
}

fn default_n() -> i64 {
    1
}

/// A usage report request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportRequest {
    pub org: String,
    pub feature: Name,
    #[serde(default = "default_n")]
    pub n: i64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub at: Option<OffsetDateTime>,
    #[serde(default)]
    pub clobber: bool,
}

async fn report(
    State(tier): State<Arc<Tier>>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<EmptyResponse> {
    let org = checked_org(Some(req.org.as_str()))?;
    tier.report_usage(
        org,
        &req.feature,
        crate::control::usage::Report {
            n: req.n,
            at: req.at,
            clobber: req.clobber,
            key: None,
        },
    )
    .await
    .map_err(Failure::from)?;
    Ok(Json(EmptyResponse {}))
}

/// The response to a whois lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoIsResponse {
    pub org: String,
    pub stripe_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<OrgInfo>,
}

async fn whois(State(tier): State<Arc<Tier>>, Query(q): Query<OrgQuery>) -> ApiResult<WhoIsResponse> {
    let org = checked_org(q.org.as_deref())?;
    if q.include.as_deref() == Some("info") {
        let (stripe_id, info) = tier.whois_info(org).await.map_err(Failure::from)?;
        Ok(Json(WhoIsResponse {
            org: org.into(),
            stripe_id,
            info: Some(info),
        }))
    } else {
        let stripe_id = tier.whois(org).await.map_err(Failure::from)?;
        Ok(Json(WhoIsResponse {
            org: org.into(),
            stripe_id,
            info: None,
        }))
    }
}

/// The response to a whoami lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub key_prefix: String,
    pub is_live: bool,
}

async fn whoami(State(tier): State<Arc<Tier>>) -> ApiResult<WhoAmIResponse> {
    let account = tier.whoami().await.map_err(Failure::from)?;
    Ok(Json(WhoAmIResponse {
        provider_id: account.id,
        email: account.email,
        key_prefix: tier.client().key_prefix().into(),
        is_live: tier.client().is_live(),
    }))
}
