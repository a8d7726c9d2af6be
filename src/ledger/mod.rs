pub mod models;
pub mod repository;

pub use models::{is_valid_number, Order, OrderStatus, User, UserBalance, Withdrawal};
pub use repository::LedgerRepository;
