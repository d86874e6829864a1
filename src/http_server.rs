use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BlockList, DomainOverride, OverrideList, OverrideType};
use crate::core::Core;
use crate::error::Result;
use crate::ingest;

/// Admin API for the config document, served over a Unix socket so only
/// the router's API service can reach it. All bodies are JSON; validation
/// failures come back as 400 with a text body, missing entries as 404.
pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/config", get(show_config))
        .route("/setRefresh", put(set_refresh))
        .route("/disableRebinding", put(disable_rebinding))
        .route("/override/{list}", put(put_override).delete(delete_override))
        .route(
            "/overrideList/{list}",
            put(put_override_list).delete(delete_override_list),
        )
        .route(
            "/quarantineHost",
            put(put_quarantine_host).delete(delete_quarantine_host),
        )
        .route(
            "/blocklists",
            get(get_blocklists).put(put_blocklist).delete(delete_blocklist),
        )
        .route(
            "/exclusions",
            get(get_exclusions).put(put_exclusion).delete(delete_exclusion),
        )
        .route("/dump_domains", get(dump_domains))
        .route("/metrics", get(metrics))
        .with_state(core)
}

/// Bind the admin socket and serve until shutdown.
pub async fn serve(core: Arc<Core>) -> Result<()> {
    let socket_path = core.paths().socket_path();
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // a stale socket from a previous run blocks the bind
    let _ = std::fs::remove_file(&socket_path);

    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "admin API listening");

    let mut shutdown = core.subscribe_shutdown();
    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, msg.into()).into_response()
}

fn not_found(msg: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, msg.into()).into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| bad_request(e.to_string()))
}

fn save_config(core: &Core) -> Response {
    match core.save_config() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn show_config(State(core): State<Arc<Core>>) -> Response {
    core.reload_config();
    Json(core.config().clone()).into_response()
}

async fn set_refresh(
    State(core): State<Arc<Core>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let seconds = match params.get("seconds").map(|s| s.parse::<u64>()) {
        Some(Ok(seconds)) => seconds,
        _ => return bad_request("seconds must be a non-negative integer"),
    };
    core.config_mut().refresh_seconds = seconds;
    save_config(&core)
}

async fn disable_rebinding(
    State(core): State<Arc<Core>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let value = match params.get("value").map(|s| s.parse::<bool>()) {
        Some(Ok(value)) => value,
        _ => return bad_request("value must be true or false"),
    };
    core.config_mut().rebinding_check_disable = value;
    save_config(&core)
}

fn validate_override(entry: &DomainOverride) -> std::result::Result<(), Response> {
    if entry.domain.is_empty() || !entry.domain.ends_with('.') {
        return Err(bad_request("domain should end in ."));
    }
    if !entry.result_ip.is_empty() && entry.result_ip.parse::<IpAddr>().is_err() {
        return Err(bad_request("Invalid IP"));
    }
    Ok(())
}

async fn put_override(
    State(core): State<Arc<Core>>,
    UrlPath(list_name): UrlPath<String>,
    body: Bytes,
) -> Response {
    let mut entry: DomainOverride = match parse_body(&body) {
        Ok(entry) => entry,
        Err(resp) => return resp,
    };
    if let Err(resp) = validate_override(&entry) {
        return resp;
    }

    // a non-zero expiration arrives as seconds-from-now
    if entry.expiration != 0 {
        entry.expiration += chrono::Utc::now().timestamp();
    }

    {
        let mut config = core.config_mut();
        let Some(list) = config.override_lists.iter_mut().find(|l| l.name == list_name) else {
            return not_found("Override list not found");
        };
        let entries = match entry.r#type {
            OverrideType::Permit => &mut list.permit_domains,
            OverrideType::Block => &mut list.block_domains,
        };
        match entries.iter_mut().find(|e| e.domain == entry.domain) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    debug!(list = list_name, "override updated");
    save_config(&core)
}

async fn delete_override(
    State(core): State<Arc<Core>>,
    UrlPath(list_name): UrlPath<String>,
    body: Bytes,
) -> Response {
    let entry: DomainOverride = match parse_body(&body) {
        Ok(entry) => entry,
        Err(resp) => return resp,
    };

    {
        let mut config = core.config_mut();
        let Some(list) = config.override_lists.iter_mut().find(|l| l.name == list_name) else {
            return not_found("Override list not found");
        };
        let entries = match entry.r#type {
            OverrideType::Permit => &mut list.permit_domains,
            OverrideType::Block => &mut list.block_domains,
        };
        let Some(pos) = entries.iter().position(|e| e.domain == entry.domain) else {
            return not_found("Entry not found");
        };
        entries.remove(pos);
    }

    save_config(&core)
}

async fn put_override_list(
    State(core): State<Arc<Core>>,
    UrlPath(list_name): UrlPath<String>,
    body: Bytes,
) -> Response {
    let incoming: OverrideList = match parse_body(&body) {
        Ok(list) => list,
        Err(resp) => return resp,
    };

    {
        let mut config = core.config_mut();
        match config.override_lists.iter_mut().find(|l| l.name == list_name) {
            Some(existing) => {
                // metadata update keeps the accumulated overrides
                existing.enabled = incoming.enabled;
                existing.tags = incoming.tags;
            }
            None => {
                let mut fresh = incoming;
                fresh.name = list_name.clone();
                config.override_lists.push(fresh);
            }
        }
    }

    save_config(&core)
}

async fn delete_override_list(
    State(core): State<Arc<Core>>,
    UrlPath(list_name): UrlPath<String>,
) -> Response {
    {
        let mut config = core.config_mut();
        let Some(pos) = config.override_lists.iter().position(|l| l.name == list_name) else {
            return not_found("Override list not found");
        };
        config.override_lists.remove(pos);
    }
    save_config(&core)
}

async fn put_quarantine_host(State(core): State<Arc<Core>>, body: Bytes) -> Response {
    let host: String = match parse_body(&body) {
        Ok(host) => host,
        Err(resp) => return resp,
    };
    if host.parse::<IpAddr>().is_err() {
        return bad_request("Invalid IP");
    }
    core.config_mut().quarantine_host_ip = host;
    save_config(&core)
}

async fn delete_quarantine_host(State(core): State<Arc<Core>>) -> Response {
    core.config_mut().quarantine_host_ip.clear();
    save_config(&core)
}

async fn get_blocklists(State(core): State<Arc<Core>>) -> Response {
    Json(core.config().block_lists.clone()).into_response()
}

async fn put_blocklist(State(core): State<Arc<Core>>, body: Bytes) -> Response {
    let entry: BlockList = match parse_body(&body) {
        Ok(entry) => entry,
        Err(resp) => return resp,
    };
    if entry.uri.is_empty() {
        return bad_request("Need URI");
    }

    {
        let mut config = core.config_mut();
        match config.block_lists.iter_mut().find(|l| l.uri == entry.uri) {
            Some(existing) => *existing = entry,
            None => config.block_lists.push(entry),
        }
    }

    let resp = save_config(&core);
    ingest::trigger_download(core.clone());
    resp
}

async fn delete_blocklist(State(core): State<Arc<Core>>, body: Bytes) -> Response {
    let entry: BlockList = match parse_body(&body) {
        Ok(entry) => entry,
        Err(resp) => return resp,
    };

    {
        let mut config = core.config_mut();
        let Some(pos) = config.block_lists.iter().position(|l| l.uri == entry.uri) else {
            return not_found("Entry not found");
        };
        config.block_lists.remove(pos);
    }

    let resp = save_config(&core);
    ingest::trigger_download(core.clone());
    resp
}

async fn get_exclusions(State(core): State<Arc<Core>>) -> Response {
    Json(core.config().client_ip_exclusions.clone()).into_response()
}

async fn put_exclusion(State(core): State<Arc<Core>>, body: Bytes) -> Response {
    let ip: String = match parse_body(&body) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };
    if ip.is_empty() {
        return bad_request("Need IP Entry");
    }
    if ip.parse::<IpAddr>().is_err() {
        return bad_request("Invalid IP");
    }

    {
        let mut config = core.config_mut();
        if !config.client_ip_exclusions.contains(&ip) {
            config.client_ip_exclusions.push(ip);
        }
    }
    save_config(&core)
}

async fn delete_exclusion(State(core): State<Arc<Core>>, body: Bytes) -> Response {
    let ip: String = match parse_body(&body) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };

    {
        let mut config = core.config_mut();
        let Some(pos) = config.client_ip_exclusions.iter().position(|e| e == &ip) else {
            return not_found("Entry not found");
        };
        config.client_ip_exclusions.remove(pos);
    }
    save_config(&core)
}

async fn dump_domains(State(core): State<Arc<Core>>) -> Response {
    match core.index_keys() {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn metrics(State(core): State<Arc<Core>>) -> Response {
    Json(core.metrics.snapshot()).into_response()
}
