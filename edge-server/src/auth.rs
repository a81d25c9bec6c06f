//! Bearer extraction and remote verification.

use anyhow::{Context as _, Result};
use axum::http::{header, HeaderMap};
use serde_json::Value;
use std::time::Duration;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pull the bearer credential out of a handshake request.
///
/// Priority: `Authorization: Bearer ...` header, then `token`/`auth` query
/// parameters (URL-decoded, with an optional `Bearer ` prefix).
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = strip_bearer(value) {
            return Some(token.to_owned());
        }
    }

    let query = query?;
    let mut token_param = None;
    let mut auth_param = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "token" if token_param.is_none() => token_param = Some(value.into_owned()),
            "auth" if auth_param.is_none() => auth_param = Some(value.into_owned()),
            _ => {}
        }
    }

    let raw = token_param.or(auth_param)?;
    let token = strip_bearer(&raw).unwrap_or(raw.trim());
    if token.is_empty() {
        return None;
    }

    Some(token.to_owned())
}

fn strip_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() < 7 || !value[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }

    let token = value[7..].trim();
    (!token.is_empty()).then_some(token)
}

/// Ask the identity collaborator to verify the bearer.
///
/// `Ok(Some(claims))` on a 200, `Ok(None)` on any other status, `Err` when
/// the service can't be reached at all.
pub async fn verify_token(
    http: &reqwest::Client,
    identity_url: &str,
    token: &str,
) -> Result<Option<Value>> {
    let url = format!("{}/auth/verify", identity_url.trim_end_matches('/'));

    let response = http
        .post(&url)
        .bearer_auth(token)
        .timeout(VERIFY_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("couldn't reach the identity service at `{url}`"))?;

    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), "token verification refused");
        return Ok(None);
    }

    let claims = response
        .json()
        .await
        .context("identity service returned an unparseable claims payload")?;

    Ok(Some(claims))
}
