//! PostgreSQL ledger store implementation.
//!
//! Settlement methods run in a single database transaction: the source
//! record is re-checked and locked, the unique
//! `(chain_id, tx_hash, transaction_type)` index absorbs duplicate
//! inserts, and balance rows are read `FOR UPDATE` before arithmetic.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, Balance, DatabaseError, DepositSession, DepositSettlement, FailedWithdrawalOutcome,
    LedgerStore, SessionStatus, SettlementOutcome, Withdrawal, WithdrawalSettlement,
    WithdrawalStatus,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL-backed [`LedgerStore`]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<DepositSession, AppError> {
        let status_str: String = row.get("status");
        Ok(DepositSession {
            id: row.get("id"),
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            chain_id: row.get("chain_id"),
            network: row.get("network"),
            wallet_address: row.get("wallet_address"),
            amount: row.get("amount"),
            crypto_currency: row.get("crypto_currency"),
            status: status_str.parse().unwrap_or(SessionStatus::Pending),
            metadata: row.get("metadata"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_withdrawal(row: &sqlx::postgres::PgRow) -> Result<Withdrawal, AppError> {
        let status_str: String = row.get("status");
        Ok(Withdrawal {
            id: row.get("id"),
            withdrawal_id: row.get("withdrawal_id"),
            user_id: row.get("user_id"),
            chain_id: row.get("chain_id"),
            network: row.get("network"),
            crypto_currency: row.get("crypto_currency"),
            usd_amount_cents: row.get("usd_amount_cents"),
            crypto_amount: row.get("crypto_amount"),
            exchange_rate: row.get("exchange_rate"),
            fee_cents: row.get("fee_cents"),
            to_address: row.get("to_address"),
            source_wallet_address: row.get("source_wallet_address"),
            tx_hash: row.get("tx_hash"),
            amount_reserved_cents: row.get("amount_reserved_cents"),
            reservation_released: row.get("reservation_released"),
            reservation_released_at: row.get("reservation_released_at"),
            status: status_str.parse().unwrap_or(WithdrawalStatus::Pending),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_balance(row: &sqlx::postgres::PgRow) -> Balance {
        Balance {
            id: row.get("id"),
            user_id: row.get("user_id"),
            currency_code: row.get("currency_code"),
            amount_cents: row.get("amount_cents"),
            amount_units: row.get("amount_units"),
            reserved_cents: row.get("reserved_cents"),
            reserved_units: row.get("reserved_units"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Inserts the transaction row. Returns false when the unique index
    /// on (chain_id, tx_hash, transaction_type) rejected a duplicate.
    async fn insert_transaction(
        tx: &mut PgTransaction<'_, Postgres>,
        record: &crate::domain::Transaction,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, deposit_session_id, withdrawal_id, chain_id, network,
                crypto_currency, tx_hash, from_address, to_address, amount,
                usd_amount_cents, exchange_rate, fee, block_number, status,
                confirmations, timestamp, verified_at, processor,
                transaction_type, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (chain_id, tx_hash, transaction_type) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.deposit_session_id)
        .bind(&record.withdrawal_id)
        .bind(&record.chain_id)
        .bind(&record.network)
        .bind(&record.crypto_currency)
        .bind(&record.tx_hash)
        .bind(&record.from_address)
        .bind(&record.to_address)
        .bind(&record.amount)
        .bind(record.usd_amount_cents)
        .bind(&record.exchange_rate)
        .bind(&record.fee)
        .bind(record.block_number)
        .bind(record.status.as_str())
        .bind(record.confirmations)
        .bind(record.timestamp)
        .bind(record.verified_at)
        .bind(record.processor.as_str())
        .bind(record.transaction_type.as_str())
        .bind(&record.metadata)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock_balance(
        tx: &mut PgTransaction<'_, Postgres>,
        user_id: &str,
        currency_code: &str,
    ) -> Result<Balance, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, currency_code, amount_cents, amount_units,
                   reserved_cents, reserved_units, updated_at
            FROM balances
            WHERE user_id = $1 AND currency_code = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(currency_code)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.map(|r| Self::row_to_balance(&r)).ok_or_else(|| {
            AppError::Database(DatabaseError::NotFound(format!(
                "balance for user {} in {}",
                user_id, currency_code
            )))
        })
    }

    async fn update_balance(
        tx: &mut PgTransaction<'_, Postgres>,
        balance_id: &str,
        amount_cents: i64,
        amount_units: &str,
        reserved_cents: i64,
        reserved_units: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE balances
            SET amount_cents = $1, amount_units = $2,
                reserved_cents = $3, reserved_units = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(amount_cents)
        .bind(amount_units)
        .bind(reserved_cents)
        .bind(reserved_units)
        .bind(Utc::now())
        .bind(balance_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_balance_log(
        tx: &mut PgTransaction<'_, Postgres>,
        user_id: &str,
        component: &str,
        currency_code: &str,
        change_cents: i64,
        description: &str,
        balance_after_cents: i64,
        transaction_id: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO balance_logs (
                id, user_id, component, currency_code, change_cents,
                change_units, description, timestamp, balance_after_cents,
                transaction_id, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'applied')
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(component)
        .bind(currency_code)
        .bind(change_cents)
        .bind(change_cents as f64 / 100.0)
        .bind(description)
        .bind(Utc::now())
        .bind(balance_after_cents)
        .bind(transaction_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_pending_deposit_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DepositSession>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, chain_id, network, wallet_address,
                   amount, crypto_currency, status, metadata, error_message,
                   created_at, updated_at
            FROM deposit_sessions
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    #[instrument(skip(self))]
    async fn load_pending_withdrawals(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Withdrawal>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, withdrawal_id, user_id, chain_id, network,
                   crypto_currency, usd_amount_cents, crypto_amount,
                   exchange_rate, fee_cents, to_address,
                   source_wallet_address, tx_hash, amount_reserved_cents,
                   reservation_released, reservation_released_at, status,
                   metadata, created_at, updated_at
            FROM withdrawals
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_withdrawal).collect()
    }

    #[instrument(skip(self))]
    async fn expire_deposit_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Option<DepositSession>, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE deposit_sessions
            SET status = 'expired', error_message = $2, updated_at = $3
            WHERE session_id = $1
              AND status NOT IN ('completed', 'failed', 'expired', 'cancelled')
            RETURNING id, session_id, user_id, chain_id, network,
                      wallet_address, amount, crypto_currency, status,
                      metadata, error_message, created_at, updated_at
            "#,
        )
        .bind(session_id)
        .bind(message)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    #[instrument(skip(self))]
    async fn get_balance(&self, user_id: &str, currency_code: &str) -> Result<Balance, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, currency_code, amount_cents, amount_units,
                   reserved_cents, reserved_units, updated_at
            FROM balances
            WHERE user_id = $1 AND currency_code = $2
            "#,
        )
        .bind(user_id)
        .bind(currency_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.map(|r| Self::row_to_balance(&r)).ok_or_else(|| {
            AppError::Database(DatabaseError::NotFound(format!(
                "balance for user {} in {}",
                user_id, currency_code
            )))
        })
    }

    #[instrument(skip(self, settlement), fields(session_id = %settlement.session.session_id))]
    async fn settle_deposit(
        &self,
        settlement: &DepositSettlement,
    ) -> Result<SettlementOutcome, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let row = sqlx::query("SELECT status FROM deposit_sessions WHERE session_id = $1 FOR UPDATE")
            .bind(&settlement.session.session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let Some(row) = row else {
            return Err(AppError::Database(DatabaseError::NotFound(
                settlement.session.session_id.clone(),
            )));
        };
        let status: SessionStatus = row
            .get::<String, _>("status")
            .parse()
            .unwrap_or(SessionStatus::Pending);
        if status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        if !Self::insert_transaction(&mut tx, &settlement.transaction).await? {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let balance = Self::lock_balance(&mut tx, &settlement.session.user_id, "USD").await?;
        let new_amount_cents = balance.amount_cents + settlement.usd_amount_cents;
        let current_units: f64 = balance.amount_units.parse().unwrap_or(0.0);
        let new_units_value = current_units + settlement.units_delta;
        if new_amount_cents < 0 || new_units_value < 0.0 {
            return Err(AppError::Invariant(format!(
                "deposit settlement for session {} would produce a negative balance",
                settlement.session.session_id
            )));
        }
        let new_units = format!("{:.18}", new_units_value);

        Self::update_balance(
            &mut tx,
            &balance.id,
            new_amount_cents,
            &new_units,
            balance.reserved_cents,
            &balance.reserved_units,
        )
        .await?;

        Self::append_balance_log(
            &mut tx,
            &settlement.session.user_id,
            "deposit",
            "USD",
            settlement.usd_amount_cents,
            &format!(
                "Credited verified deposit for session {}",
                settlement.session.session_id
            ),
            new_amount_cents,
            Some(&settlement.transaction.id),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE deposit_sessions
            SET status = 'completed', metadata = $2, updated_at = $3
            WHERE session_id = $1
            "#,
        )
        .bind(&settlement.session.session_id)
        .bind(&settlement.transaction.metadata)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let mut updated = balance;
        updated.amount_cents = new_amount_cents;
        updated.amount_units = new_units;
        updated.updated_at = Utc::now();
        Ok(SettlementOutcome::Applied { balance: updated })
    }

    #[instrument(skip(self, settlement), fields(withdrawal_id = %settlement.withdrawal.withdrawal_id))]
    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> Result<SettlementOutcome, AppError> {
        let withdrawal = &settlement.withdrawal;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let row = sqlx::query(
            "SELECT status, reservation_released FROM withdrawals WHERE withdrawal_id = $1 FOR UPDATE",
        )
        .bind(&withdrawal.withdrawal_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let Some(row) = row else {
            return Err(AppError::Database(DatabaseError::NotFound(
                withdrawal.withdrawal_id.clone(),
            )));
        };
        let status: WithdrawalStatus = row
            .get::<String, _>("status")
            .parse()
            .unwrap_or(WithdrawalStatus::Pending);
        if status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }
        let reservation_released: bool = row.get("reservation_released");

        if !Self::insert_transaction(&mut tx, &settlement.transaction).await? {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let balance = Self::lock_balance(&mut tx, &withdrawal.user_id, "USD").await?;
        let new_amount_cents = balance.amount_cents - settlement.usd_amount_cents;
        let current_units: f64 = balance.amount_units.parse().unwrap_or(0.0);
        let new_units_value = current_units - settlement.units_delta;
        if new_amount_cents < 0 || new_units_value < 0.0 {
            return Err(AppError::Invariant(format!(
                "insufficient balance for withdrawal {}",
                withdrawal.withdrawal_id
            )));
        }
        let new_units = format!("{:.18}", new_units_value);

        let new_reserved_cents = if reservation_released {
            balance.reserved_cents
        } else {
            let released = balance.reserved_cents - withdrawal.amount_reserved_cents;
            if released < 0 {
                return Err(AppError::Invariant(format!(
                    "reservation release for withdrawal {} exceeds reserved balance",
                    withdrawal.withdrawal_id
                )));
            }
            released
        };
        if new_amount_cents < new_reserved_cents {
            return Err(AppError::Invariant(format!(
                "withdrawal {} would leave reserved funds exceeding the balance",
                withdrawal.withdrawal_id
            )));
        }
        let new_reserved_units = format!("{:.18}", new_reserved_cents as f64 / 100.0);

        Self::update_balance(
            &mut tx,
            &balance.id,
            new_amount_cents,
            &new_units,
            new_reserved_cents,
            &new_reserved_units,
        )
        .await?;

        Self::append_balance_log(
            &mut tx,
            &withdrawal.user_id,
            "withdrawal",
            "USD",
            -settlement.usd_amount_cents,
            &format!(
                "Debited verified withdrawal {}",
                withdrawal.withdrawal_id
            ),
            new_amount_cents,
            Some(&settlement.transaction.id),
        )
        .await?;

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE withdrawals
            SET status = 'completed',
                reservation_released = TRUE,
                reservation_released_at = COALESCE(reservation_released_at, $2),
                updated_at = $2
            WHERE withdrawal_id = $1
            "#,
        )
        .bind(&withdrawal.withdrawal_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let mut updated = balance;
        updated.amount_cents = new_amount_cents;
        updated.amount_units = new_units;
        updated.reserved_cents = new_reserved_cents;
        updated.reserved_units = new_reserved_units;
        updated.updated_at = now;
        Ok(SettlementOutcome::Applied { balance: updated })
    }

    #[instrument(skip(self, withdrawal), fields(withdrawal_id = %withdrawal.withdrawal_id))]
    async fn fail_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
    ) -> Result<FailedWithdrawalOutcome, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let row = sqlx::query(
            "SELECT status, reservation_released FROM withdrawals WHERE withdrawal_id = $1 FOR UPDATE",
        )
        .bind(&withdrawal.withdrawal_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let Some(row) = row else {
            return Err(AppError::Database(DatabaseError::NotFound(
                withdrawal.withdrawal_id.clone(),
            )));
        };
        let status: WithdrawalStatus = row
            .get::<String, _>("status")
            .parse()
            .unwrap_or(WithdrawalStatus::Pending);
        if status.is_terminal() {
            return Ok(FailedWithdrawalOutcome::AlreadySettled);
        }
        let reservation_released: bool = row.get("reservation_released");

        let now = Utc::now();
        let mut released_cents = 0;

        if !reservation_released {
            // Reserved funds return to the available pool; amount_cents
            // is untouched in the reservation model.
            let balance = Self::lock_balance(&mut tx, &withdrawal.user_id, "USD").await?;
            let new_reserved_cents = balance.reserved_cents - withdrawal.amount_reserved_cents;
            if new_reserved_cents < 0 {
                return Err(AppError::Invariant(format!(
                    "reservation release for withdrawal {} exceeds reserved balance",
                    withdrawal.withdrawal_id
                )));
            }
            let new_reserved_units = format!("{:.18}", new_reserved_cents as f64 / 100.0);

            Self::update_balance(
                &mut tx,
                &balance.id,
                balance.amount_cents,
                &balance.amount_units,
                new_reserved_cents,
                &new_reserved_units,
            )
            .await?;

            Self::append_balance_log(
                &mut tx,
                &withdrawal.user_id,
                "withdrawal",
                "USD",
                withdrawal.amount_reserved_cents,
                &format!(
                    "Released reserved balance for failed withdrawal {}: {}",
                    withdrawal.withdrawal_id, reason
                ),
                balance.amount_cents,
                None,
            )
            .await?;

            released_cents = withdrawal.amount_reserved_cents;
        }

        let updated_row = sqlx::query(
            r#"
            UPDATE withdrawals
            SET status = 'failed',
                reservation_released = TRUE,
                reservation_released_at = COALESCE(reservation_released_at, $2),
                updated_at = $2
            WHERE withdrawal_id = $1
            RETURNING id, withdrawal_id, user_id, chain_id, network,
                      crypto_currency, usd_amount_cents, crypto_amount,
                      exchange_rate, fee_cents, to_address,
                      source_wallet_address, tx_hash, amount_reserved_cents,
                      reservation_released, reservation_released_at, status,
                      metadata, created_at, updated_at
            "#,
        )
        .bind(&withdrawal.withdrawal_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(FailedWithdrawalOutcome::Applied {
            withdrawal: Self::row_to_withdrawal(&updated_row)?,
            released_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }
}
