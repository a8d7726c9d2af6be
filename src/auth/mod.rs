pub mod jwt;
pub mod password;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, AppResult};

pub use jwt::{issue_token, verify_token};
pub use password::{hash_password, verify_password};

/// Authenticated user id, inserted into request extensions by `require_auth`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

/// Middleware guarding the protected routes: verifies the JWT from the
/// `Authorization` header and exposes the user id to handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> AppResult<Response> {
    let token = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw))
        .ok_or(AppError::Unauthorized)?;

    let user_id = verify_token(&state.jwt_secret, token)?;
    request.extensions_mut().insert(AuthUser(user_id));

    Ok(next.run(request).await)
}
