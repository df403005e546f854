//! Order and user records for the saga system.
//!
//! Orders are created by the CreateOrder saga step and mutated only by saga
//! steps and compensation; they are never deleted. Item prices are
//! snapshotted at creation time and immutable afterwards.

pub mod error;
pub mod model;
pub mod postgres;
pub mod store;
pub mod user;

pub use error::{OrderError, Result};
pub use model::{Money, Order, OrderItem, OrderStatus, total_amount};
pub use postgres::{PostgresOrderStore, PostgresUserStore};
pub use store::{InMemoryOrderStore, OrderStore};
pub use user::{InMemoryUserStore, User, UserStore};
