use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use uuid::Uuid;

/// Order status lifecycle.
///
/// `Processed` and `Invalid` are terminal: the reconciliation pipeline never
/// touches an order again once it reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

/// User entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub login: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Order entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub accrual: Decimal,
    pub uploaded_at: DateTime<Utc>,
}

/// Per-user balance snapshot: running total plus the monotone withdrawn sum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

/// Append-only withdrawal log entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Withdrawal {
    #[serde(rename = "order")]
    pub order_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Luhn doubling table: double-and-reduce precomputed per digit
const LUHN_DOUBLED: [u32; 10] = [0, 2, 4, 6, 8, 1, 3, 5, 7, 9];

/// Checks an order number's Luhn checksum.
///
/// Returns false for the empty string and for any character outside '0'-'9'.
pub fn is_valid_number(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let odd = number.len() & 1;
    let mut sum = 0u32;
    for (i, c) in number.chars().enumerate() {
        let digit = match c.to_digit(10) {
            Some(d) => d,
            None => return false,
        };
        if i & 1 == odd {
            sum += LUHN_DOUBLED[digit as usize];
        } else {
            sum += digit;
        }
    }

    sum % 10 == 0
}
