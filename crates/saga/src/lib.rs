//! Outbox-driven order saga.
//!
//! The saga advances an order through three steps, each one local
//! transaction plus one outbox record:
//!
//! 1. CreateOrder — insert the order, record `order.created`
//! 2. DeductStock — consume `order.created`, deduct stock, record
//!    `order.deduct_stock`
//! 3. CompletePayment — consume `order.deduct_stock`, debit the wallet,
//!    record `order.payment` and `order.success` (or `order.failed`)
//!
//! Events flow through the [`broker::MessageBroker`] keyed by aggregate ID,
//! so one order's events stay ordered. The [`dispatcher::EventDispatcher`]
//! publishes recorded rows with a bounded retry budget, and the
//! [`poller::RecoveryPoller`] re-drives stuck rows and compensates failed
//! ones in the background. There is no cross-resource transaction anywhere;
//! correctness comes from step-level atomicity, idempotent handlers, and
//! compensation.

pub mod broker;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod poller;
pub mod steps;

pub use broker::{BrokerError, InMemoryBroker, Message, MessageBroker};
pub use consumer::{DeliveryLocks, spawn_consumers};
pub use dispatcher::EventDispatcher;
pub use error::{FailureKind, Result, SagaError};
pub use events::{
    DeductStockPayload, OrderCreatedPayload, OrderFailedPayload, OrderItemSnapshot,
    OrderSummaryPayload, PaymentPayload, WalletSnapshot,
};
pub use poller::RecoveryPoller;
pub use steps::{NewOrderItem, OrderSaga};
