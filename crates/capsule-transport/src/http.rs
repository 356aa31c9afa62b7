//! Shared helpers for the JSON-over-HTTP side channel

use capsule_core::Error;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;

/// Attach the bearer token when one is configured.
pub fn authorized(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Pass successful responses through; turn anything else into `Error::Http`.
pub async fn expect_success(response: Response) -> Result<Response, Error> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(response).await)
    }
}

/// Build an `Error::Http` from a failed response, preferring the body's
/// `detail` field.
pub async fn error_from_response(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Http {
        status: status.as_u16(),
        detail: extract_detail(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string()),
    }
}

/// Pull a human-readable message out of an error body.
///
/// `detail` may be a string or a structured validation list; plain-text bodies
/// are used as-is.
pub fn extract_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => match obj.get("detail") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        },
        Ok(_) => None,
        Err(_) => Some(trimmed.to_string()),
    }
}

pub(crate) fn transport_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::transport(format!("{}: {}", context, err))
}
