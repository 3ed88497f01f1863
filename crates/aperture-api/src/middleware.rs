use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::error;

use aperture_types::api::Claims;

use crate::AppState;

/// Extract and validate the bearer JWT from the Authorization header, then
/// stash the claims as a request extension. Tokens come from an external
/// identity service; the first validated request for a user also provisions
/// their identity row.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let claims = token_data.claims;

    {
        let db = state.db.clone();
        let id = claims.sub.to_string();
        let username = claims.username.clone();
        tokio::task::spawn_blocking(move || db.ensure_user(&id, &username))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
