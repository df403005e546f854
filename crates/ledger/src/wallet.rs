//! Point wallet ledger with optimistic versioning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{UserId, WalletId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Unique identifier for a point ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(Uuid);

impl PointId {
    /// Creates a new random point ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a point ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PointId {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of wallet mutation a point entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Points added to the wallet.
    Charge,
    /// Points spent on an order.
    Payment,
}

impl TransactionType {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Charge => "CHARGE",
            TransactionType::Payment => "PAYMENT",
        }
    }

    /// Parses from the persisted string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "CHARGE" => Some(TransactionType::Charge),
            "PAYMENT" => Some(TransactionType::Payment),
            _ => None,
        }
    }
}

/// A user's point wallet.
///
/// `version` is the optimistic concurrency token: every successful mutation
/// increments it by exactly one, and writers must present the version they
/// read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub total_point: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// An append-only wallet audit entry.
///
/// The signed amounts of a wallet's points always sum to its `total_point`;
/// [`WalletLedger::reconcile`] checks that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub wallet_id: WalletId,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Trait for wallet ledger implementations.
///
/// Mutations are optimistic: the ledger never blocks readers, and a writer
/// that lost a race gets [`LedgerError::VersionConflict`] back. Whether to
/// retry is the caller's decision.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Creates a wallet for the user with an initial balance.
    ///
    /// Idempotent: if the user already has a wallet it is returned as-is.
    async fn create(&self, user_id: UserId, initial_point: i64) -> Result<Wallet>;

    /// Adds points to the user's wallet.
    async fn charge(&self, user_id: &UserId, amount: i64) -> Result<Wallet>;

    /// Spends points from the user's wallet.
    ///
    /// Fails with [`LedgerError::InsufficientBalance`] if the balance cannot
    /// cover `amount`; the wallet is left untouched and no point row is
    /// written.
    async fn debit(&self, user_id: &UserId, amount: i64) -> Result<Wallet>;

    /// Fetches the user's wallet.
    async fn get(&self, user_id: &UserId) -> Result<Option<Wallet>>;

    /// Lists a wallet's audit entries, oldest first.
    async fn points(&self, wallet_id: &WalletId) -> Result<Vec<Point>>;

    /// Checks that the point entries sum to the wallet balance.
    async fn reconcile(&self, user_id: &UserId) -> Result<bool>;
}

#[derive(Default)]
struct WalletState {
    wallets: HashMap<UserId, Wallet>,
    points: Vec<Point>,
}

/// In-memory wallet ledger.
///
/// The read-then-compare-and-swap in `charge`/`debit` mirrors the SQL
/// `UPDATE ... WHERE id = $1 AND version = $2` of the PostgreSQL
/// implementation: the snapshot is taken under a read lock, and the write
/// lock re-checks the version before applying.
#[derive(Clone, Default)]
pub struct InMemoryWalletLedger {
    state: Arc<RwLock<WalletState>>,
}

impl InMemoryWalletLedger {
    /// Creates a new empty in-memory wallet ledger.
    pub fn new() -> Self {
        Self::default()
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

        let mut state = self.state.write().await;
        let wallet = state
            .wallets
            .get_mut(user_id)
            .ok_or(LedgerError::WalletNotFound(*user_id))?;

        // Compare-and-swap on the version read above.
        if wallet.version != snapshot.version {
            metrics::counter!("wallet_version_conflicts").increment(1);
            return Err(LedgerError::VersionConflict {
                wallet_id: wallet.id,
                expected: snapshot.version,
            });
        }

        wallet.total_point += signed_amount;
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        let updated = wallet.clone();

        state.points.push(Point {
            id: PointId::new(),
            wallet_id: updated.id,
            amount: signed_amount,
            transaction_type,
            created_at: updated.updated_at,
            expired_at: None,
        });

        Ok(updated)
    }
}

#[async_trait]
impl WalletLedger for InMemoryWalletLedger {
    async fn create(&self, user_id: UserId, initial_point: i64) -> Result<Wallet> {
        if initial_point < 0 {
            return Err(LedgerError::InvalidAmount(initial_point));
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state.wallets.get(&user_id) {
            return Ok(existing.clone());
        }

        let wallet = Wallet {
            id: WalletId::new(),
            user_id,
            total_point: initial_point,
            version: 0,
            updated_at: Utc::now(),
        };
        state.wallets.insert(user_id, wallet.clone());

        if initial_point > 0 {
            state.points.push(Point {
                id: PointId::new(),
                wallet_id: wallet.id,
                amount: initial_point,
                transaction_type: TransactionType::Charge,
                created_at: wallet.updated_at,
                expired_at: None,
            });
        }

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
        let state = self.state.read().await;
        Ok(state.wallets.get(user_id).cloned())
    }

    async fn points(&self, wallet_id: &WalletId) -> Result<Vec<Point>> {
        let state = self.state.read().await;
        Ok(state
            .points
            .iter()
            .filter(|point| point.wallet_id == *wallet_id)
            .cloned()
            .collect())
    }

    async fn reconcile(&self, user_id: &UserId) -> Result<bool> {
        let state = self.state.read().await;
        let wallet = state
            .wallets
            .get(user_id)
            .ok_or(LedgerError::WalletNotFound(*user_id))?;

        let sum: i64 = state
            .points
            .iter()
            .filter(|point| point.wallet_id == wallet.id)
            .map(|point| point.amount)
            .sum();

        Ok(sum == wallet.total_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();

        let first = ledger.create(user_id, 100).await.unwrap();
        let second = ledger.create(user_id, 500).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.total_point, 100);
    }

    #[tokio::test]
    async fn charge_increments_version_and_writes_point() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 0).await.unwrap();

        let wallet = ledger.charge(&user_id, 250).await.unwrap();

        assert_eq!(wallet.total_point, 250);
        assert_eq!(wallet.version, 1);

        let points = ledger.points(&wallet.id).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].amount, 250);
        assert_eq!(points[0].transaction_type, TransactionType::Charge);
    }

    #[tokio::test]
    async fn debit_writes_negative_point() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 300).await.unwrap();

        let wallet = ledger.debit(&user_id, 120).await.unwrap();

        assert_eq!(wallet.total_point, 180);
        assert_eq!(wallet.version, 1);

        let points = ledger.points(&wallet.id).await.unwrap();
        let payment = points
            .iter()
            .find(|p| p.transaction_type == TransactionType::Payment)
            .unwrap();
        assert_eq!(payment.amount, -120);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_wallet_untouched() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 100).await.unwrap();

        let result = ledger.debit(&user_id, 150).await;
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));

        let wallet = ledger.get(&user_id).await.unwrap().unwrap();
        assert_eq!(wallet.total_point, 100);
        assert_eq!(wallet.version, 0);
        // Only the seeding point row exists.
        assert_eq!(ledger.points(&wallet.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_or_negative_amounts_rejected() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 100).await.unwrap();

        assert!(matches!(
            ledger.charge(&user_id, 0).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            ledger.debit(&user_id, -5).await,
            Err(LedgerError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_wallet_not_found() {
        let ledger = InMemoryWalletLedger::new();
        let result = ledger.charge(&UserId::new(), 100).await;
        assert!(matches!(result, Err(LedgerError::WalletNotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_charges_stay_consistent() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.charge(&user_id, 50).await }));
        }

        let mut successes: i64 = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                // Losers surface the conflict; nothing is silently lost.
                Err(LedgerError::VersionConflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let wallet = ledger.get(&user_id).await.unwrap().unwrap();
        assert!(successes >= 1);
        assert_eq!(wallet.version, successes);
        assert_eq!(wallet.total_point, successes * 50);
        assert!(ledger.reconcile(&user_id).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_sums_point_entries() {
        let ledger = InMemoryWalletLedger::new();
        let user_id = UserId::new();
        ledger.create(user_id, 1000).await.unwrap();
        ledger.charge(&user_id, 200).await.unwrap();
        ledger.debit(&user_id, 300).await.unwrap();

        assert!(ledger.reconcile(&user_id).await.unwrap());
        let wallet = ledger.get(&user_id).await.unwrap().unwrap();
        assert_eq!(wallet.total_point, 900);
        assert_eq!(wallet.version, 2);
    }
}
