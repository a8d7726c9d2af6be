use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::models::{Order, OrderStatus, User, UserBalance, Withdrawal};
use crate::error::{AppError, AppResult};

const PG_UNIQUE_VIOLATION: &str = "23505";

/// Ledger repository - the source of truth for users, orders and balances
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== USER OPERATIONS ==========

    pub async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
        let result = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (login, password_hash)
            VALUES ($1, $2)
            RETURNING id, login, password_hash, created_at
            "#,
        )
        .bind(login)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(user) => Ok(user),
            Err(e) if is_unique_violation(&e) => Err(AppError::LoginTaken),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_user(&self, login: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, login, password_hash, created_at
            FROM users
            WHERE login = $1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    // ========== ORDER OPERATIONS ==========

    pub async fn add_order(&self, number: &str, user_id: Uuid) -> AppResult<Order> {
        let result = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (number, user_id, status, accrual)
            VALUES ($1, $2, 'new', 0)
            RETURNING id, number, user_id, status, accrual, uploaded_at
            "#,
        )
        .bind(number)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(order) => Ok(order),
            Err(e) if is_unique_violation(&e) => Err(AppError::OrderAlreadyUploaded),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_order(&self, number: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn user_orders(&self, user_id: Uuid) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Orders still awaiting a verdict from the accrual service, newest first.
    pub async fn orders_awaiting_verdict(&self, limit: i64) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE status IN ('new', 'processing')
            ORDER BY uploaded_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Writes the verdict onto the order and credits the accrual, atomically.
    ///
    /// The UPDATE is guarded to non-terminal states so a processed or invalid
    /// order can never be re-credited, and the balance credit lands in the
    /// same transaction as the status change.
    pub async fn update_order_and_credit(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        status: OrderStatus,
        accrual: Decimal,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3
            WHERE id = $1 AND status IN ('new', 'processing')
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(accrual)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Already terminal; nothing to credit.
            debug!(%order_id, "skipping verdict for order already in a terminal state");
            tx.rollback().await?;
            return Ok(());
        }

        if status == OrderStatus::Processed && !accrual.is_zero() {
            Self::apply_delta(&mut tx, user_id, accrual).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ========== BALANCE OPERATIONS ==========

    /// The sole mutator of `balances.amount`: upsert-on-conflict adding the
    /// signed delta and returning the resulting amount. A negative result
    /// rejects the whole enclosing transaction.
    pub async fn apply_delta(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        delta: Decimal,
    ) -> AppResult<Decimal> {
        let row = sqlx::query(
            r#"
            INSERT INTO balances (user_id, amount)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
                DO UPDATE SET amount = balances.amount + EXCLUDED.amount
            RETURNING amount
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(&mut **tx)
        .await?;

        let amount: Decimal = row.try_get("amount")?;
        if amount < Decimal::ZERO {
            return Err(AppError::InsufficientFunds {
                required: delta.abs().to_string(),
            });
        }

        Ok(amount)
    }

    /// Appends a withdrawal record and debits the balance in one transaction.
    /// Both roll back if the debit would drive the balance negative.
    pub async fn record_withdrawal(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: Decimal,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO withdrawals (user_id, order_number, sum)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(order_number)
        .bind(sum)
        .execute(&mut *tx)
        .await?;

        Self::apply_delta(&mut tx, user_id, -sum).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_balance(&self, user_id: Uuid) -> AppResult<UserBalance> {
        let mut tx = self.pool.begin().await?;

        let current: Decimal = sqlx::query(
            r#"
            SELECT COALESCE(
                (SELECT amount FROM balances WHERE user_id = $1),
                0
            ) AS amount
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("amount")?;

        let withdrawn: Decimal = sqlx::query(
            r#"
            SELECT COALESCE(SUM(sum), 0) AS withdrawn
            FROM withdrawals
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("withdrawn")?;

        tx.commit().await?;

        Ok(UserBalance { current, withdrawn })
    }

    pub async fn withdrawal_history(&self, user_id: Uuid) -> AppResult<Vec<Withdrawal>> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(
            r#"
            SELECT order_number, sum, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| code == PG_UNIQUE_VIOLATION)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn seed_user_with_balance(repo: &LedgerRepository, amount: Decimal) -> Uuid {
        let user = repo.create_user("alice", "not-a-real-hash").await.unwrap();
        let order = repo.add_order("49927398716", user.id).await.unwrap();
        repo.update_order_and_credit(order.id, user.id, OrderStatus::Processed, amount)
            .await
            .unwrap();
        user.id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn rejected_withdrawal_leaves_the_ledger_untouched(pool: PgPool) {
        let repo = LedgerRepository::new(pool);
        let user_id = seed_user_with_balance(&repo, dec!(100)).await;

        let err = repo
            .record_withdrawal(user_id, "79927398713", dec!(150.5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));

        // Neither the debit nor the withdrawal row survives the rollback.
        let balance = repo.get_balance(user_id).await.unwrap();
        assert_eq!(balance.current, dec!(100));
        assert_eq!(balance.withdrawn, Decimal::ZERO);
        assert!(repo.withdrawal_history(user_id).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn successful_withdrawal_debits_and_logs(pool: PgPool) {
        let repo = LedgerRepository::new(pool);
        let user_id = seed_user_with_balance(&repo, dec!(100)).await;

        repo.record_withdrawal(user_id, "79927398713", dec!(40.25))
            .await
            .unwrap();

        let balance = repo.get_balance(user_id).await.unwrap();
        assert_eq!(balance.current, dec!(59.75));
        assert_eq!(balance.withdrawn, dec!(40.25));

        let history = repo.withdrawal_history(user_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_number, "79927398713");
        assert_eq!(history[0].sum, dec!(40.25));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn terminal_order_is_never_credited_twice(pool: PgPool) {
        let repo = LedgerRepository::new(pool);
        let user = repo.create_user("alice", "not-a-real-hash").await.unwrap();
        let order = repo.add_order("49927398716", user.id).await.unwrap();

        repo.update_order_and_credit(order.id, user.id, OrderStatus::Processed, dec!(42.5))
            .await
            .unwrap();
        // A late duplicate verdict hits the terminal-status guard and is a no-op.
        repo.update_order_and_credit(order.id, user.id, OrderStatus::Processed, dec!(42.5))
            .await
            .unwrap();

        let balance = repo.get_balance(user.id).await.unwrap();
        assert_eq!(balance.current, dec!(42.5));

        let stored = repo.get_order("49927398716").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Processed);
        assert_eq!(stored.accrual, dec!(42.5));
    }
}
