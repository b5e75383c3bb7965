//! HTTP request handlers.

use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize};

use super::config::{ConfigFile, SatelliteSpec};
use super::error::ApiError;
use super::registry::{authorize_admin, authorize_satellite, evaluate_health};
use super::store::ReportReceipt;
use super::AppState;
use crate::models::{ReportPacket, Satellite, SatelliteView};
use crate::protocol::{
    payload_hash, AGENT_VERSION, AUTH_HEADER, CONFIG_VERSION_HEADER, PAYLOAD_HASH_HEADER,
    VERSION_HEADER,
};

fn respond(uri: &Uri, result: Result<Response, ApiError>) -> Response {
    result.unwrap_or_else(|err| err.at(uri.path()).into_response())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {}", e)))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    authorize_admin(&state.store.get(), header(headers, AUTH_HEADER)).map_err(|err| {
        tracing::warn!("Rejected admin request: {}", err);
        ApiError::from(err)
    })
}

// ============================================================================
// Satellite routes
// ============================================================================

pub async fn handle_get_targets(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, get_targets(&state, &name, &headers))
}

fn get_targets(state: &AppState, name: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let snap = state.store.get();
    let satellite = authorize_satellite(&snap, name, header(headers, AUTH_HEADER)).map_err(|err| {
        tracing::warn!(satellite = %name, "Rejected target fetch: {}", err);
        ApiError::from(err)
    })?;

    let targets = snap.targets_for(satellite);
    if targets.is_empty() {
        return Err(ApiError::unavailable(format!("satellite {} has no targets", name)));
    }

    tracing::debug!(satellite = %name, "Serving {} targets at version {}", targets.len(), snap.version);
    Ok((
        [(CONFIG_VERSION_HEADER, snap.version.to_string())],
        Json(targets),
    )
        .into_response())
}

pub async fn handle_submit_metrics(
    State(state): State<AppState>,
    Path((name, target)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(&uri, submit_metrics(&state, &name, &target, &headers, &body).await)
}

async fn submit_metrics(
    state: &AppState,
    name: &str,
    target: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let snap = state.store.get();
    let satellite = authorize_satellite(&snap, name, header(headers, AUTH_HEADER)).map_err(|err| {
        tracing::warn!(satellite = %name, "Rejected submission: {}", err);
        ApiError::from(err)
    })?;
    if !satellite.targets.contains(target) {
        return Err(ApiError::not_found(format!(
            "target {} is not assigned to satellite {}",
            target, name
        )));
    }

    let version_header = [(CONFIG_VERSION_HEADER, snap.version.to_string())];
    let presented: i64 = header(headers, CONFIG_VERSION_HEADER)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::bad_request("missing or invalid configuration version"))?;
    if presented < snap.version {
        tracing::info!(
            satellite = %name,
            target_name = %target,
            "Discarding report built on configuration {}, current is {}",
            presented,
            snap.version
        );
        return Ok((StatusCode::NO_CONTENT, version_header).into_response());
    }

    let hash = payload_hash(body);
    match header(headers, PAYLOAD_HASH_HEADER) {
        Some(claimed) if claimed.eq_ignore_ascii_case(&hash) => {}
        Some(_) => return Err(ApiError::bad_request("payload hash does not match body")),
        None => return Err(ApiError::bad_request("missing payload hash")),
    }

    let packet: ReportPacket = parse_json(body)?;
    if packet.satellite_name != name || packet.target_name != target {
        return Err(ApiError::bad_request("report does not match request path"));
    }
    if let Some(agent) = header(headers, VERSION_HEADER).filter(|v| *v != AGENT_VERSION) {
        tracing::debug!(satellite = %name, "Satellite runs agent version {}", agent);
    }

    let accepted = packet.probes.len();
    match state.store.record_report(name, target, &hash, Utc::now()) {
        ReportReceipt::Duplicate => {
            tracing::debug!(satellite = %name, target_name = %target, "Duplicate report acknowledged");
            return Ok((version_header, Json(serde_json::json!({ "accepted": 0 }))).into_response());
        }
        ReportReceipt::Accepted => {}
    }

    if state.sink_tx.send(packet).await.is_err() {
        tracing::error!("Metric sink is closed, dropping report from {}", name);
    }
    tracing::debug!(satellite = %name, target_name = %target, "Accepted {} batches", accepted);
    Ok((version_header, Json(serde_json::json!({ "accepted": accepted }))).into_response())
}

// ============================================================================
// Admin: satellites
// ============================================================================

/// Partial update of a satellite.
#[derive(Debug, Default, Deserialize)]
pub struct SatellitePatch {
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub targets: Option<BTreeSet<String>>,
}

fn view_of(satellite: Option<&Satellite>, name: &str) -> Result<Response, ApiError> {
    satellite
        .map(|s| Json(SatelliteView::from(s)).into_response())
        .ok_or_else(|| ApiError::not_found(format!("satellite {} is not configured", name)))
}

pub async fn handle_list_satellites(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, list_satellites(&state, &headers))
}

fn list_satellites(state: &AppState, headers: &HeaderMap) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let snap = state.store.get();
    let views: Vec<SatelliteView> = snap.satellites.values().map(SatelliteView::from).collect();
    Ok(Json(views).into_response())
}

pub async fn handle_create_satellite(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(&uri, create_satellite(&state, &headers, &body))
}

fn create_satellite(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let spec: SatelliteSpec = parse_json(body)?;
    let name = spec.name.clone();

    let snap = state.store.update(|file: &mut ConfigFile| {
        if file.satellites.iter().any(|s| s.name == spec.name) {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("satellite {} already exists", spec.name),
            ));
        }
        file.satellites.push(spec);
        Ok(())
    })?;

    tracing::info!(satellite = %name, "Created satellite");
    let resp = view_of(snap.satellites.get(&name), &name)?;
    Ok((StatusCode::CREATED, resp).into_response())
}

pub async fn handle_get_satellite(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, get_satellite(&state, &name, &headers))
}

fn get_satellite(state: &AppState, name: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    view_of(state.store.get().satellites.get(name), name)
}

pub async fn handle_put_satellite(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(&uri, put_satellite(&state, &name, &headers, &body))
}

fn put_satellite(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let mut spec: SatelliteSpec = parse_json(body)?;
    if !spec.name.is_empty() && spec.name != name {
        return Err(ApiError::bad_request("satellite name does not match path"));
    }
    spec.name = name.to_string();

    let snap = state.store.update(|file: &mut ConfigFile| {
        match file.satellites.iter_mut().find(|s| s.name == name) {
            Some(existing) => *existing = spec,
            None => file.satellites.push(spec),
        }
        Ok::<(), ApiError>(())
    })?;

    tracing::info!(satellite = %name, "Replaced satellite");
    view_of(snap.satellites.get(name), name)
}

pub async fn handle_patch_satellite(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(&uri, patch_satellite(&state, &name, &headers, &body))
}

fn patch_satellite(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let patch: SatellitePatch = parse_json(body)?;

    let snap = state.store.update(|file: &mut ConfigFile| {
        let existing = file
            .satellites
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ApiError::not_found(format!("satellite {} is not configured", name)))?;
        if let Some(secret) = patch.secret {
            existing.secret = secret;
        }
        if let Some(active) = patch.active {
            existing.active = active;
        }
        if let Some(targets) = patch.targets {
            existing.targets = targets;
        }
        Ok::<(), ApiError>(())
    })?;

    tracing::info!(satellite = %name, "Patched satellite");
    view_of(snap.satellites.get(name), name)
}

pub async fn handle_delete_satellite(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, delete_satellite(&state, &name, &headers))
}

fn delete_satellite(state: &AppState, name: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    state.store.update(|file: &mut ConfigFile| {
        let before = file.satellites.len();
        file.satellites.retain(|s| s.name != name);
        if file.satellites.len() == before {
            return Err(ApiError::not_found(format!("satellite {} is not configured", name)));
        }
        Ok(())
    })?;
    tracing::info!(satellite = %name, "Deleted satellite");
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// Admin: configuration
// ============================================================================

pub async fn handle_get_config(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, get_config(&state, &headers))
}

fn get_config(state: &AppState, headers: &HeaderMap) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    Ok(Json(state.store.get().redacted()).into_response())
}

pub async fn handle_put_config(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(&uri, put_config(&state, &headers, &body))
}

fn put_config(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let file: ConfigFile = parse_json(body)?;
    let snap = state.store.replace(file)?;
    tracing::info!("Configuration replaced through the admin API");
    Ok(Json(snap.redacted()).into_response())
}

pub async fn handle_reload_config(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    respond(&uri, reload_config(&state, &headers))
}

fn reload_config(state: &AppState, headers: &HeaderMap) -> Result<Response, ApiError> {
    require_admin(state, headers)?;
    let snap = state.store.reload().inspect_err(|e| {
        tracing::error!("Configuration reload failed, keeping current: {}", e);
    })?;
    Ok(Json(snap.redacted()).into_response())
}

// ============================================================================
// Health and version
// ============================================================================

pub async fn handle_health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (snap, liveness) = state.store.liveness();
    let report = evaluate_health(&snap, &liveness, Utc::now());
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    for failing in report.failing() {
        tracing::warn!(
            satellite = %failing.name,
            "No report for {}s (threshold {}s)",
            failing.elapsed_secs,
            failing.threshold_secs
        );
    }

    if authorize_admin(&snap, header(&headers, AUTH_HEADER)).is_ok() {
        return (status, Json(report)).into_response();
    }
    let coarse = if report.healthy { "ok" } else { "degraded" };
    (status, Json(serde_json::json!({ "status": coarse }))).into_response()
}

pub async fn handle_version(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": AGENT_VERSION,
        "config_version": state.store.get().version,
    }))
}
