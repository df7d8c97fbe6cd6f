//! HTTP plumbing shared by monitors: the cookie-keyed session pool,
//! conditional requests and cache-TTL parsing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::monitor::EntityState;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Clients shared by cookie-jar file path. Entities that use the same
/// cookies file share a session; no cookies file means the shared
/// cookieless client.
pub struct SessionPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, cookies_file: Option<&Path>) -> reqwest::Client {
        let key = cookies_file
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut clients = self.clients.lock().expect("session pool lock poisoned");
        if let Some(client) = clients.get(&key) {
            return client.clone();
        }
        let mut builder = reqwest::Client::builder().timeout(DEFAULT_REQUEST_TIMEOUT);
        if let Some(path) = cookies_file {
            if let Some(jar) = load_cookie_jar(path) {
                builder = builder.cookie_provider(jar);
            }
        }
        let client = builder.build().expect("failed to build HTTP client");
        clients.insert(key, client.clone());
        client
    }
}

/// Load a Mozilla/Netscape-format cookies file into a jar. A missing file
/// yields a sessionless jar rather than an error; unparsable lines are
/// skipped.
pub fn load_cookie_jar(path: &Path) -> Option<Arc<Jar>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "cookies file not found, continuing without cookies");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load cookies");
            return None;
        }
    };

    let jar = Jar::default();
    let mut loaded = 0usize;
    for line in text.lines() {
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            debug!(path = %path.display(), "skipping malformed cookie line");
            continue;
        }
        let (domain, cookie_path, secure, name, value) =
            (fields[0], fields[2], fields[3], fields[5], fields[6]);
        let host = domain.trim_start_matches('.');
        let scheme = if secure.eq_ignore_ascii_case("TRUE") {
            "https"
        } else {
            "http"
        };
        let Ok(url) = format!("{scheme}://{host}/").parse::<reqwest::Url>() else {
            continue;
        };
        let mut cookie = format!("{name}={value}; Domain={host}; Path={cookie_path}");
        if secure.eq_ignore_ascii_case("TRUE") {
            cookie.push_str("; Secure");
        }
        jar.add_cookie_str(&cookie, &url);
        loaded += 1;
    }
    info!(path = %path.display(), cookies = loaded, "loaded cookies");
    Some(Arc::new(jar))
}

/// TTL the server suggests for the fetched representation:
/// `Cache-Control: max-age` wins, else a future `Expires`.
pub fn get_cache_ttl(headers: &HeaderMap) -> Option<Duration> {
    if let Some(value) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(seconds) = directive.strip_prefix("max-age=") {
                if let Ok(seconds) = seconds.trim().parse::<u64>() {
                    return Some(Duration::from_secs(seconds));
                }
            }
        }
    }
    let expires = headers.get("expires").and_then(|v| v.to_str().ok())?;
    let expires: DateTime<Utc> = DateTime::parse_from_rfc2822(expires).ok()?.with_timezone(&Utc);
    let ttl = expires - Utc::now();
    ttl.to_std().ok()
}

/// Conditional GET against `url`. Returns the response body on a fresh 2xx;
/// `None` means nothing new (304) or a failure that has already been folded
/// into the entity's backoff state. Never retries; retry intent lives in
/// the polling interval.
pub async fn conditional_fetch(
    client: &reqwest::Client,
    entity: &str,
    url: &str,
    adjust_interval: bool,
    state: &mut EntityState,
) -> Option<String> {
    let mut request = client.get(url);
    if let Some(last_modified) = &state.last_modified {
        request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
    }
    if let Some(etag) = &state.etag {
        request = request.header(IF_NONE_MATCH, etag.as_str());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(entity, url, error = %e, "error while fetching");
            back_off_logged(state, entity, url);
            return None;
        }
    };

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        // Some servers omit cache headers on 304, so only update on 200.
        debug!(entity, url, "got 304, nothing new");
        return None;
    }
    if !status.is_success() {
        warn!(entity, url, status = %status, "got error status while fetching");
        back_off_logged(state, entity, url);
        return None;
    }

    let headers = response.headers().clone();
    // Drain the body fully so the connection can be reused.
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!(entity, url, error = %e, "error while reading response body");
            back_off_logged(state, entity, url);
            return None;
        }
    };

    state.last_modified = header_string(&headers, LAST_MODIFIED.as_str());
    state.etag = header_string(&headers, ETAG.as_str());
    debug!(
        entity,
        last_modified = state.last_modified.as_deref().unwrap_or("absent"),
        etag = state.etag.as_deref().unwrap_or("absent"),
        "captured cache headers"
    );

    if adjust_interval {
        let previous = state.update_interval;
        state.adapt(get_cache_ttl(&headers));
        if state.update_interval != previous {
            info!(
                entity,
                interval_secs = state.update_interval.as_secs_f64(),
                "next update interval from cache TTL"
            );
        }
    } else if state.update_interval != state.base_update_interval {
        info!(
            entity,
            interval_secs = state.base_update_interval.as_secs_f64(),
            "restoring update interval after backoff"
        );
        state.restore();
    }

    Some(body)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn back_off_logged(state: &mut EntityState, entity: &str, url: &str) {
    if state.back_off() {
        warn!(
            entity,
            url,
            interval_secs = state.update_interval.as_secs_f64(),
            "update interval increased after failure"
        );
    }
}
