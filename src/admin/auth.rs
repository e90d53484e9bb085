use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use super::AdminState;

/// Reject requests without `Authorization: Bearer <api_key>` when a key is configured
pub async fn require_api_key(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = match &state.api_key {
        Some(key) => key,
        None => return Ok(next.run(request).await),
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => {
            tracing::debug!(path = %request.uri().path(), "Rejected admin request without valid api key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
