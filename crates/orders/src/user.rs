//! User records and store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new user with a fresh ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Trait for user store implementations.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts a user, replacing any existing record with the same ID.
    async fn insert(&self, user: User) -> Result<()>;

    /// Fetches a user by ID.
    async fn get(&self, user_id: &UserId) -> Result<Option<User>>;

    /// Returns true if the user exists.
    async fn exists(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.get(user_id).await?.is_some())
    }
}

/// In-memory user store.
#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    users: Arc<RwLock<HashMap<UserId, User>>>,
}

impl InMemoryUserStore {
    /// Creates a new empty in-memory user store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: User) -> Result<()> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }

    async fn get(&self, user_id: &UserId) -> Result<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}
