//! Wallet balances and the append-only balance ledger.
//!
//! `pay_wallets.balance` is a materialized projection of the ledger: every
//! successful balance mutation writes exactly one `pay_wallet_transactions`
//! row carrying the signed delta and the balance snapshot after it.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One wallet per (user_id, user_type) pair.
#[derive(Debug, Clone, FromRow)]
pub struct PayWallet {
    pub id: Uuid,
    pub user_id: String,
    pub user_type: i16,
    pub balance: i64,
    pub frozen_price: i64,
    pub total_expense: i64,
    pub total_recharge: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger row; `balance` is the wallet balance immediately
/// after applying `price`.
#[derive(Debug, Clone, FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub biz_type: String,
    pub biz_id: String,
    pub title: String,
    /// Signed delta in minor units.
    pub price: i64,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_or_create(
        &self,
        user_id: &str,
        user_type: i16,
    ) -> Result<PayWallet, DatabaseError>;

    async fn get(&self, id: Uuid) -> Result<Option<PayWallet>, DatabaseError>;

    /// Apply a signed delta to the balance and totals in one conditional
    /// update. Returns the post-update balance, or None when a negative
    /// delta would drive the balance below zero.
    async fn add_balance(&self, id: Uuid, delta: i64) -> Result<Option<i64>, DatabaseError>;

    /// Move funds balance → frozen; false when the balance is insufficient.
    async fn freeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError>;

    /// Move funds frozen → balance; false when frozen is insufficient.
    async fn unfreeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError>;

    async fn insert_transaction(
        &self,
        transaction: &WalletTransaction,
    ) -> Result<WalletTransaction, DatabaseError>;

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, DatabaseError>;
}

const WALLET_COLUMNS: &str = "id, user_id, user_type, balance, frozen_price, total_expense, \
     total_recharge, created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, wallet_id, biz_type, biz_id, title, price, balance, created_at";

pub struct PgWalletRepository {
    pool: PgPool,
}

impl PgWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletStore for PgWalletRepository {
    async fn get_or_create(
        &self,
        user_id: &str,
        user_type: i16,
    ) -> Result<PayWallet, DatabaseError> {
        // Insert-or-return in one statement keeps concurrent first touches
        // of the same user from racing.
        sqlx::query_as::<_, PayWallet>(&format!(
            "INSERT INTO pay_wallets (id, user_id, user_type)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id, user_type) DO UPDATE SET updated_at = pay_wallets.updated_at
             RETURNING {WALLET_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(user_type)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayWallet>, DatabaseError> {
        sqlx::query_as::<_, PayWallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM pay_wallets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn add_balance(&self, id: Uuid, delta: i64) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE pay_wallets
             SET balance = balance + $2,
                 total_recharge = total_recharge + GREATEST($2, 0),
                 total_expense = total_expense + GREATEST(-$2, 0),
                 updated_at = NOW()
             WHERE id = $1 AND balance + $2 >= 0
             RETURNING balance",
        )
        .bind(id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(|(balance,)| balance))
    }

    async fn freeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_wallets
             SET balance = balance - $2, frozen_price = frozen_price + $2, updated_at = NOW()
             WHERE id = $1 AND balance >= $2",
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn unfreeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_wallets
             SET balance = balance + $2, frozen_price = frozen_price - $2, updated_at = NOW()
             WHERE id = $1 AND frozen_price >= $2",
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_transaction(
        &self,
        transaction: &WalletTransaction,
    ) -> Result<WalletTransaction, DatabaseError> {
        sqlx::query_as::<_, WalletTransaction>(&format!(
            "INSERT INTO pay_wallet_transactions
                 (id, wallet_id, biz_type, biz_id, title, price, balance)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(transaction.id)
        .bind(transaction.wallet_id)
        .bind(&transaction.biz_type)
        .bind(&transaction.biz_id)
        .bind(&transaction.title)
        .bind(transaction.price)
        .bind(transaction.balance)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, DatabaseError> {
        sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM pay_wallet_transactions
             WHERE wallet_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
