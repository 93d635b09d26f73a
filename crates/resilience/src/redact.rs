//! Redaction helpers for anything that ends up in an error message or a log line.
//!
//! Upstream URLs may carry credentials (userinfo, `?api_key=...` query auth), so we never echo
//! them verbatim.

use url::Url;

/// Maximum number of bytes of an upstream response body kept in an error message.
pub const MAX_ERROR_BODY_BYTES: usize = 512;

#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    // Best-effort: drop credentials + query + fragment.
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

/// Truncate an upstream body to something safe to embed in an error.
#[must_use]
pub fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
