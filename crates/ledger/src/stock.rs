//! Product stock ledger with pessimistic row locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ProductId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{LedgerError, Result};

/// A product's stock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    /// The product this row tracks.
    pub product_id: ProductId,
    /// Units on hand. Never negative by construction.
    pub stock: u32,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// Trait for stock ledger implementations.
///
/// Deduction is all-or-nothing across the requested batch: rows are locked
/// exclusively in sorted product order (the `BTreeMap` iteration order) and
/// every row is validated before any row is mutated. A single insufficient
/// row fails the whole batch with no partial deduction.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Deducts the given quantities from stock, atomically for the batch.
    async fn deduct(&self, quantities: &BTreeMap<ProductId, u32>) -> Result<()>;

    /// Adds units back to a product's stock. Used by compensation.
    async fn add(&self, product_id: &ProductId, quantity: u32) -> Result<()>;

    /// Fetches a product's stock row.
    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductStock>>;

    /// Creates or replaces a product's stock row.
    async fn upsert(&self, product_id: ProductId, stock: u32) -> Result<()>;
}

/// In-memory stock ledger.
///
/// Each row sits behind its own `tokio::sync::Mutex`, the in-process
/// equivalent of `SELECT ... FOR UPDATE`: a deduction holds every requested
/// row's lock for the duration of the batch, serializing concurrent
/// deductors on overlapping products.
#[derive(Clone, Default)]
pub struct InMemoryStockLedger {
    rows: Arc<RwLock<BTreeMap<ProductId, Arc<Mutex<ProductStock>>>>>,
}

impl InMemoryStockLedger {
    /// Creates a new empty in-memory stock ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    #[tracing::instrument(skip(self, quantities), fields(products = quantities.len()))]
    async fn deduct(&self, quantities: &BTreeMap<ProductId, u32>) -> Result<()> {
        // Resolve all rows up front so a missing product fails before any
        // lock is taken.
        let locks: Vec<(ProductId, u32, Arc<Mutex<ProductStock>>)> = {
            let rows = self.rows.read().await;
            let mut locks = Vec::with_capacity(quantities.len());
            for (product_id, &quantity) in quantities {
                let row = rows
                    .get(product_id)
                    .cloned()
                    .ok_or_else(|| LedgerError::ProductNotFound(product_id.clone()))?;
                locks.push((product_id.clone(), quantity, row));
            }
            locks
        };

        // Acquire every row lock in sorted product order. A conflicting
        // deduction that shares products always requests the common prefix
        // in the same order, so lock-ordering deadlocks cannot occur.
        let mut guards = Vec::with_capacity(locks.len());
        for (_, _, row) in &locks {
            guards.push(row.lock().await);
        }

        // Validate the whole batch before touching any row.
        for (guard, (product_id, quantity, _)) in guards.iter().zip(&locks) {
            if guard.stock < *quantity {
                metrics::counter!("stock_deduct_rejected").increment(1);
                return Err(LedgerError::OutOfStock {
                    product_id: product_id.clone(),
                    requested: *quantity,
                    available: guard.stock,
                });
            }
        }

        let now = Utc::now();
        for (guard, (_, quantity, _)) in guards.iter_mut().zip(&locks) {
            guard.stock -= *quantity;
            guard.updated_at = now;
        }
        metrics::counter!("stock_deduct_applied").increment(1);

        Ok(())
    }

    async fn add(&self, product_id: &ProductId, quantity: u32) -> Result<()> {
        let row = {
            let rows = self.rows.read().await;
            rows.get(product_id)
                .cloned()
                .ok_or_else(|| LedgerError::ProductNotFound(product_id.clone()))?
        };

        let mut guard = row.lock().await;
        guard.stock += quantity;
        guard.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductStock>> {
        let row = {
            let rows = self.rows.read().await;
            rows.get(product_id).cloned()
        };

        match row {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn upsert(&self, product_id: ProductId, stock: u32) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(
            product_id.clone(),
            Arc::new(Mutex::new(ProductStock {
                product_id,
                stock,
                updated_at: Utc::now(),
            })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(entries: &[(&str, u32)]) -> InMemoryStockLedger {
        let ledger = InMemoryStockLedger::new();
        for (id, stock) in entries {
            ledger.upsert(ProductId::new(*id), *stock).await.unwrap();
        }
        ledger
    }

    fn batch(entries: &[(&str, u32)]) -> BTreeMap<ProductId, u32> {
        entries
            .iter()
            .map(|(id, qty)| (ProductId::new(*id), *qty))
            .collect()
    }

    #[tokio::test]
    async fn deduct_applies_whole_batch() {
        let ledger = seeded(&[("SKU-001", 10), ("SKU-002", 5)]).await;

        ledger
            .deduct(&batch(&[("SKU-001", 3), ("SKU-002", 2)]))
            .await
            .unwrap();

        assert_eq!(ledger.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock, 7);
        assert_eq!(ledger.get(&ProductId::new("SKU-002")).await.unwrap().unwrap().stock, 3);
    }

    #[tokio::test]
    async fn insufficient_row_fails_batch_without_partial_deduction() {
        let ledger = seeded(&[("SKU-001", 10), ("SKU-002", 1)]).await;

        let result = ledger
            .deduct(&batch(&[("SKU-001", 3), ("SKU-002", 2)]))
            .await;

        assert!(matches!(result, Err(LedgerError::OutOfStock { .. })));
        // Nothing was touched, not even the sufficient row.
        assert_eq!(ledger.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock, 10);
        assert_eq!(ledger.get(&ProductId::new("SKU-002")).await.unwrap().unwrap().stock, 1);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let ledger = seeded(&[("SKU-001", 10)]).await;

        let result = ledger.deduct(&batch(&[("SKU-404", 1)])).await;
        assert!(matches!(result, Err(LedgerError::ProductNotFound(_))));
    }

    #[tokio::test]
    async fn add_restores_units() {
        let ledger = seeded(&[("SKU-001", 10)]).await;
        let product = ProductId::new("SKU-001");

        ledger.deduct(&batch(&[("SKU-001", 4)])).await.unwrap();
        ledger.add(&product, 4).await.unwrap();

        assert_eq!(ledger.get(&product).await.unwrap().unwrap().stock, 10);
    }

    #[tokio::test]
    async fn concurrent_deductions_never_oversell() {
        let ledger = seeded(&[("SKU-001", 5)]).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.deduct(&batch(&[("SKU-001", 1)])).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 5);
        assert_eq!(ledger.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock, 0);
    }
}
