use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use tracing::info;

use super::models::{Credentials, OrderResponse, WithdrawRequest};
use super::AppState;
use crate::auth::{self, AuthUser};
use crate::error::{AppError, AppResult};
use crate::ledger::is_valid_number;

pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// POST /api/user/register
pub async fn register(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> AppResult<Response> {
    if credentials.login.is_empty() {
        return Err(AppError::InvalidInput("login is empty".to_string()));
    }

    let password_hash = auth::hash_password(&credentials.password)?;
    let user = state
        .ledger
        .create_user(&credentials.login, &password_hash)
        .await?;

    info!(login = %user.login, "registered new user");

    let token = auth::issue_token(&state.jwt_secret, user.id, state.jwt_ttl)?;
    Ok((StatusCode::OK, [(header::AUTHORIZATION, token)]).into_response())
}

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> AppResult<Response> {
    if credentials.login.is_empty() {
        return Err(AppError::InvalidInput("login is empty".to_string()));
    }

    let user = state
        .ledger
        .find_user(&credentials.login)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !auth::verify_password(&credentials.password, &user.password_hash) {
        return Err(AppError::Unauthorized);
    }

    let token = auth::issue_token(&state.jwt_secret, user.id, state.jwt_ttl)?;
    Ok((StatusCode::OK, [(header::AUTHORIZATION, token)]).into_response())
}

/// POST /api/user/orders — body is the raw order number
pub async fn upload_order(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    number: String,
) -> AppResult<Response> {
    let number = number.trim();
    if !is_valid_number(number) {
        return Err(AppError::InvalidOrderNumber);
    }

    match state.ledger.add_order(number, user_id).await {
        Ok(order) => {
            info!(number = %order.number, "order accepted for reconciliation");
            Ok(StatusCode::ACCEPTED.into_response())
        }
        Err(AppError::OrderAlreadyUploaded) => {
            let existing = state
                .ledger
                .get_order(number)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("order {}", number)))?;

            if existing.user_id == user_id {
                Ok(StatusCode::OK.into_response())
            } else {
                Err(AppError::OrderOwnedByAnotherUser)
            }
        }
        Err(e) => Err(e),
    }
}

/// GET /api/user/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Response> {
    let orders = state.ledger.user_orders(user_id).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(body).into_response())
}

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Response> {
    let balance = state.ledger.get_balance(user_id).await?;
    Ok(Json(balance).into_response())
}

/// POST /api/user/balance/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<WithdrawRequest>,
) -> AppResult<Response> {
    if !is_valid_number(&request.order) {
        return Err(AppError::InvalidOrderNumber);
    }

    state
        .ledger
        .record_withdrawal(user_id, &request.order, request.sum)
        .await?;

    info!(order = %request.order, sum = %request.sum, "withdrawal recorded");
    Ok(StatusCode::OK.into_response())
}

/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Response> {
    let withdrawals = state.ledger.withdrawal_history(user_id).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    Ok(Json(withdrawals).into_response())
}
