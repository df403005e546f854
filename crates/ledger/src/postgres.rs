//! PostgreSQL ledger implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProductId, UserId, WalletId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::stock::{ProductStock, StockLedger};
use crate::wallet::{Point, PointId, TransactionType, Wallet, WalletLedger};

/// PostgreSQL-backed stock ledger.
///
/// `deduct` takes row-level exclusive locks on all requested rows with one
/// `SELECT ... ORDER BY product_id FOR UPDATE`, validates every row, and
/// only then applies the deductions, all inside one transaction.
#[derive(Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
}

impl PostgresStockLedger {
    /// Creates a new PostgreSQL stock ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_stock(row: PgRow) -> Result<ProductStock> {
        Ok(ProductStock {
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            stock: row.try_get::<i32, _>("stock")? as u32,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    #[tracing::instrument(skip(self, quantities), fields(products = quantities.len()))]
    async fn deduct(&self, quantities: &BTreeMap<ProductId, u32>) -> Result<()> {
        let product_ids: Vec<String> = quantities
            .keys()
            .map(|id| id.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await?;

        // Sorted lock order avoids deadlock between overlapping batches.
        let rows = sqlx::query(
            r#"
            SELECT product_id, stock, updated_at
            FROM product_stocks
            WHERE product_id = ANY($1)
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(&product_ids)
        .fetch_all(&mut *tx)
        .await?;

        let locked: BTreeMap<ProductId, u32> = rows
            .into_iter()
            .map(|row| {
                let stock = Self::row_to_stock(row)?;
                Ok((stock.product_id, stock.stock))
            })
            .collect::<Result<_>>()?;

        // Validate the whole batch before mutating any row.
        for (product_id, &quantity) in quantities {
            let available = *locked
                .get(product_id)
                .ok_or_else(|| LedgerError::ProductNotFound(product_id.clone()))?;
            if available < quantity {
                metrics::counter!("stock_deduct_rejected").increment(1);
                return Err(LedgerError::OutOfStock {
                    product_id: product_id.clone(),
                    requested: quantity,
                    available,
                });
            }
        }

        for (product_id, &quantity) in quantities {
            sqlx::query(
                r#"
                UPDATE product_stocks
                SET stock = stock - $2, updated_at = NOW()
                WHERE product_id = $1
                "#,
            )
            .bind(product_id.as_str())
            .bind(quantity as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::counter!("stock_deduct_applied").increment(1);
        Ok(())
    }

    async fn add(&self, product_id: &ProductId, quantity: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE product_stocks
            SET stock = stock + $2, updated_at = NOW()
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .bind(quantity as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::ProductNotFound(product_id.clone()));
        }
        Ok(())
    }

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductStock>> {
        let row = sqlx::query(
            "SELECT product_id, stock, updated_at FROM product_stocks WHERE product_id = $1",
        )
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stock).transpose()
    }

    async fn upsert(&self, product_id: ProductId, stock: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO product_stocks (product_id, stock, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (product_id) DO UPDATE SET
                stock = EXCLUDED.stock,
                updated_at = NOW()
            "#,
        )
        .bind(product_id.as_str())
        .bind(stock as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// PostgreSQL-backed wallet ledger.
///
/// Mutations write back with `WHERE id = $1 AND version = $2`; zero rows
/// affected means the caller lost a race and gets `VersionConflict`. The
/// point audit row is inserted in the same transaction as the balance
/// update.
#[derive(Clone)]
pub struct PostgresWalletLedger {
    pool: PgPool,
}

impl PostgresWalletLedger {
    /// Creates a new PostgreSQL wallet ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_wallet(row: PgRow) -> Result<Wallet> {
        Ok(Wallet {
            id: WalletId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            total_point: row.try_get("total_point")?,
            version: row.try_get("version")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_point(row: PgRow) -> Result<Point> {
        let type_raw: String = row.try_get("transaction_type")?;
        let transaction_type = TransactionType::from_str_opt(&type_raw).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown transaction type: {type_raw}").into())
        })?;

        Ok(Point {
            id: PointId::from_uuid(row.try_get::<Uuid, _>("id")?),
            wallet_id: WalletId::from_uuid(row.try_get::<Uuid, _>("wallet_id")?),
            amount: row.try_get("amount")?,
            transaction_type,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            expired_at: row.try_get::<Option<DateTime<Utc>>, _>("expired_at")?,
        })
    }

    async fn mutate(
        &self,
        user_id: &UserId,
        amount: i64,
        transaction_type: TransactionType,
    ) -> Result<Wallet> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let snapshot = self
            .get(user_id)
            .await?
            .ok_or(LedgerError::WalletNotFound(*user_id))?;

        let signed_amount = match transaction_type {
            TransactionType::Charge => amount,
            TransactionType::Payment => {
                if snapshot.total_point < amount {
                    return Err(LedgerError::InsufficientBalance {
                        wallet_id: snapshot.id,
                        available: snapshot.total_point,
                        requested: amount,
                    });
                }
                -amount
            }
        };
        let new_total = snapshot.total_point + signed_amount;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET total_point = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(snapshot.id.as_uuid())
        .bind(new_total)
        .bind(snapshot.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            metrics::counter!("wallet_version_conflicts").increment(1);
            return Err(LedgerError::VersionConflict {
                wallet_id: snapshot.id,
                expected: snapshot.version,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO points (id, wallet_id, amount, transaction_type, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(snapshot.id.as_uuid())
        .bind(signed_amount)
        .bind(transaction_type.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let updated = self
            .get(user_id)
            .await?
            .ok_or(LedgerError::WalletNotFound(*user_id))?;
        Ok(updated)
    }
}

#[async_trait]
impl WalletLedger for PostgresWalletLedger {
    async fn create(&self, user_id: UserId, initial_point: i64) -> Result<Wallet> {
        if initial_point < 0 {
            return Err(LedgerError::InvalidAmount(initial_point));
        }

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, total_point, version, updated_at)
            VALUES ($1, $2, $3, 0, NOW())
            ON CONFLICT (user_id) DO NOTHING
            RETURNING id, user_id, total_point, version, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.as_uuid())
        .bind(initial_point)
        .fetch_optional(&mut *tx)
        .await?;

        let wallet = match inserted {
            Some(row) => {
                let wallet = Self::row_to_wallet(row)?;
                if initial_point > 0 {
                    sqlx::query(
                        r#"
                        INSERT INTO points (id, wallet_id, amount, transaction_type, created_at)
                        VALUES ($1, $2, $3, $4, NOW())
                        "#,
                    )
                    .bind(Uuid::new_v4())
                    .bind(wallet.id.as_uuid())
                    .bind(initial_point)
                    .bind(TransactionType::Charge.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                wallet
            }
            None => {
                let row = sqlx::query(
                    "SELECT id, user_id, total_point, version, updated_at FROM wallets WHERE user_id = $1",
                )
                .bind(user_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
                Self::row_to_wallet(row)?
            }
        };

        tx.commit().await?;
        Ok(wallet)
    }

    #[tracing::instrument(skip(self))]
    async fn charge(&self, user_id: &UserId, amount: i64) -> Result<Wallet> {
        self.mutate(user_id, amount, TransactionType::Charge).await
    }

    #[tracing::instrument(skip(self))]
    async fn debit(&self, user_id: &UserId, amount: i64) -> Result<Wallet> {
        self.mutate(user_id, amount, TransactionType::Payment).await
    }

    async fn get(&self, user_id: &UserId) -> Result<Option<Wallet>> {
        let row = sqlx::query(
            "SELECT id, user_id, total_point, version, updated_at FROM wallets WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_wallet).transpose()
    }

    async fn points(&self, wallet_id: &WalletId) -> Result<Vec<Point>> {
        let rows = sqlx::query(
            r#"
            SELECT id, wallet_id, amount, transaction_type, created_at, expired_at
            FROM points
            WHERE wallet_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(wallet_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_point).collect()
    }

    async fn reconcile(&self, user_id: &UserId) -> Result<bool> {
        let wallet = self
            .get(user_id)
            .await?
            .ok_or(LedgerError::WalletNotFound(*user_id))?;

        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM points WHERE wallet_id = $1",
        )
        .bind(wallet.id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(sum == wallet.total_point)
    }
}
