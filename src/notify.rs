//! Balance-change notification boundary
//!
//! The account engine reports every balance-affecting event through this
//! trait; delivery (UI, push, event bus) belongs to the embedding
//! application.

use bitcoin::Transaction;

/// Why a transaction notification is being delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    /// A spend created by this wallet
    Send,
    /// An incoming payment
    Receive,
    /// A previously counted transaction was invalidated by a double spend
    DoubleSpend,
    /// Transactions imported in bulk from an external source
    FromApi,
}

/// Sink for balance-change notifications.
pub trait NotificationSink: Send + Sync {
    /// Called whenever the account balance changes. `tx` is `None` for
    /// recomputations not tied to a single transaction.
    fn notify_tx(&self, account_tag: &str, tx: Option<&Transaction>, kind: TxKind, delta: i64);
}

/// Sink that discards all notifications.
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify_tx(&self, _account_tag: &str, _tx: Option<&Transaction>, _kind: TxKind, _delta: i64) {
    }
}
