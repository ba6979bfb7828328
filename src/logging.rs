//! Middleware for logging requests and responses.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// The number of bytes of a body that are logged at the `info` level.
pub const LOG_BODY_LENGTH_LIMIT: usize = 64;

/// The JSON fields whose values are never written to the logs.
const REDACTED_FIELDS: [&str; 3] = ["access_token", "secret", "access_credential"];

/// Log the request and response for each request.
///
/// Both the request and response are logged at the `info` level.
/// If a body is longer than [LOG_BODY_LENGTH_LIMIT] bytes, it is truncated
/// and the full body is logged at the `debug` level. Credential fields in
/// JSON bodies are redacted.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let (parts, body) = request.into_parts();

    let body_bytes = match read_body(body).await {
        Ok(body_bytes) => body_bytes,
        Err(error) => {
            tracing::error!("Could not read request body: {error}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let body_text = redact_fields(&String::from_utf8_lossy(&body_bytes));
    log_body(
        &format!("Received request: {} {}", parts.method, parts.uri),
        &body_text,
    );

    let response = next.run(Request::from_parts(parts, body_bytes.into())).await;

    let (parts, body) = response.into_parts();
    let body_bytes = match read_body(body).await {
        Ok(body_bytes) => body_bytes,
        Err(error) => {
            tracing::error!("Could not read response body: {error}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    log_body(
        &format!(
            "Sending response: {} after {}ms",
            parts.status,
            start_time.elapsed().as_millis()
        ),
        &redact_fields(&String::from_utf8_lossy(&body_bytes)),
    );

    Response::from_parts(parts, body_bytes.into())
}

async fn read_body(body: Body) -> Result<Bytes, axum::Error> {
    axum::body::to_bytes(body, usize::MAX).await
}

/// Replace the string values of [REDACTED_FIELDS] in a JSON text.
fn redact_fields(json_text: &str) -> String {
    let mut redacted = json_text.to_owned();

    for field_name in REDACTED_FIELDS {
        let key = format!("\"{field_name}\"");
        let mut search_from = 0;

        while let Some(key_offset) = redacted[search_from..].find(&key) {
            let after_key = search_from + key_offset + key.len();
            let Some(value_start) = value_start(&redacted, after_key) else {
                search_from = after_key;
                continue;
            };
            let Some(value_length) = redacted[value_start..].find('"') else {
                break;
            };

            redacted.replace_range(value_start..value_start + value_length, "********");
            search_from = value_start;
        }
    }

    redacted
}

/// Find where the string value after a JSON key starts, skipping the colon
/// and whitespace. Returns `None` if the value is not a string.
fn value_start(json_text: &str, after_key: usize) -> Option<usize> {
    let rest = &json_text[after_key..];
    let colon = rest.find(|c: char| !c.is_whitespace())?;

    if !rest[colon..].starts_with(':') {
        return None;
    }

    let after_colon = &rest[colon + 1..];
    let quote = after_colon.find(|c: char| !c.is_whitespace())?;

    after_colon[quote..]
        .starts_with('"')
        .then_some(after_key + colon + 1 + quote + 1)
}

fn log_body(message: &str, body: &str) {
    if body.len() > LOG_BODY_LENGTH_LIMIT {
        let mut end = LOG_BODY_LENGTH_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }

        tracing::info!("{message}\nbody: {}...", &body[..end]);
        tracing::debug!("Full body: {body:?}");
    } else {
        tracing::info!("{message}\nbody: {body:?}");
    }
}
