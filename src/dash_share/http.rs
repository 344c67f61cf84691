// dash_share - Shareable view-state links for weather dashboards
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::{LoadOutcome, SaveOutcome, ShareMetrics};
use crate::snapshot::StateSnapshot;
use crate::store::{LoadError, RestoreStatus, SaveError, ShareStateStore};
use crate::token::ShareToken;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Query parameter carrying a share token in dashboard URLs.
pub const STATE_PARAM: &str = "state";

pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

const OPENMETRICS_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const RESTORE_NOTICE: &str = "The shared view could not be restored, showing the default view instead.";
const TOKEN_ENCODE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-');

/// Everything a request handler needs, shared by all requests.
#[derive(Debug)]
pub struct RequestContext {
    store: ShareStateStore,
    metrics: ShareMetrics,
    registry: Registry,
    default_state: StateSnapshot,
    public_url: String,
}

impl RequestContext {
    pub fn new(store: ShareStateStore, default_state: StateSnapshot, public_url: &str) -> Self {
        let mut registry = Registry::default();
        let metrics = ShareMetrics::new(&mut registry);

        RequestContext {
            store,
            metrics,
            registry,
            default_state,
            public_url: public_url.to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ShareResponse {
    pub token: String,
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ViewResponse {
    pub state: StateSnapshot,
    pub restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build a dashboard link that restores the view named by `token`.
pub fn share_url(public_url: &str, token: &ShareToken) -> String {
    let sep = if public_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}={}",
        public_url,
        sep,
        STATE_PARAM,
        utf8_percent_encode(token.as_str(), TOKEN_ENCODE)
    )
}

pub fn router(context: Arc<RequestContext>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/share", post(save_view))
        .route("/share/:token", get(fetch_view))
        .route("/view", get(restore_view))
        .route("/metrics", get(text_metrics))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

async fn save_view(State(context): State<Arc<RequestContext>>, Json(snapshot): Json<StateSnapshot>) -> Response {
    let store = context.store.clone();
    let res = match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(message = "save task failed", error = %e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "unable to save view".to_owned());
        }
    };

    match res {
        Ok(token) => {
            context.metrics.save(SaveOutcome::Saved);
            tracing::info!(message = "created shared view", token = %token);

            let url = share_url(&context.public_url, &token);
            let body = ShareResponse {
                token: token.to_string(),
                url,
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => {
            context.metrics.save(SaveOutcome::from(&e));
            tracing::error!(message = "unable to save shared view", error = %e);

            let status = match e {
                SaveError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, "sharing is unavailable right now".to_owned())
        }
    }
}

async fn fetch_view(State(context): State<Arc<RequestContext>>, Path(token): Path<String>) -> Response {
    let store = context.store.clone();
    let res = match tokio::task::spawn_blocking(move || store.load(&token)).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(message = "load task failed", error = %e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "unable to load view".to_owned());
        }
    };

    match res {
        Ok(snapshot) => {
            context.metrics.load(LoadOutcome::Restored);
            Json(snapshot).into_response()
        }
        Err(e) => {
            context.metrics.load(LoadOutcome::from(&e));
            match e {
                LoadError::Backend(token, reason) => {
                    tracing::error!(message = "unable to read shared view", token = %token, error = %reason);
                    error_response(StatusCode::SERVICE_UNAVAILABLE, "shared views are unavailable right now".to_owned())
                }
                LoadError::CorruptRecord(token, reason) => {
                    tracing::warn!(message = "corrupt shared view record", token = %token, error = %reason);
                    error_response(StatusCode::NOT_FOUND, "no such shared view".to_owned())
                }
                other => {
                    tracing::debug!(message = "shared view not found", error = %other);
                    error_response(StatusCode::NOT_FOUND, "no such shared view".to_owned())
                }
            }
        }
    }
}

/// First value of the `state` parameter. Repeated or unrelated parameters are ignored.
fn requested_token(params: Vec<(String, String)>) -> Option<String> {
    params.into_iter().find(|(k, _)| k == STATE_PARAM).map(|(_, v)| v)
}

// Query pairs are taken as a plain list so that no user-edited URL is rejected before
// falling back to the default view.
async fn restore_view(
    State(context): State<Arc<RequestContext>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<ViewResponse> {
    let token = requested_token(params);
    let requested = token.is_some();
    let ctx = context.clone();
    let outcome = match tokio::task::spawn_blocking(move || ctx.store.restore(token.as_deref(), &ctx.default_state)).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(message = "restore task failed", error = %e);
            return Json(ViewResponse {
                state: context.default_state.clone(),
                restored: false,
                notice: requested.then(|| RESTORE_NOTICE.to_owned()),
            });
        }
    };

    let (state, status) = (outcome.snapshot, outcome.status);
    context.metrics.load(LoadOutcome::from(&status));
    let (restored, notice) = match status {
        RestoreStatus::Restored(_) => (true, None),
        RestoreStatus::Default => (false, None),
        RestoreStatus::Fallback(_) => (false, Some(RESTORE_NOTICE.to_owned())),
    };

    Json(ViewResponse { state, restored, notice })
}

async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    let mut buf = String::new();

    match encode(&mut buf, &context.registry) {
        Ok(_) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, OPENMETRICS_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
