//! Services the execution flow consumes but does not own: who the current
//! user is, and how many credits they have.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

// ─────────────────────────────────────────────────────────────────────────────
// SessionProvider
// ─────────────────────────────────────────────────────────────────────────────

pub trait SessionProvider: Send + Sync {
    /// Id of the signed-in user, if any.
    fn current_user_id(&self) -> Option<String>;
}

/// A session pinned to one user id (or anonymous).
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    user_id: Option<String>,
}

impl StaticSession {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: user_id.filter(|id| !id.trim().is_empty()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CreditLedger
// ─────────────────────────────────────────────────────────────────────────────

/// Per-user credit balances.
///
/// Kept behind a trait so the orchestration layer can be tested against an
/// in-memory ledger and wired to a real billing service in production.
pub trait CreditLedger: Send + Sync {
    fn balance<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, f64>;

    /// Deducts `amount` atomically. Returns false when the balance is too low,
    /// in which case nothing is deducted.
    fn deduct<'a>(&'a self, user_id: &'a str, amount: f64) -> BoxFuture<'a, bool>;
}

/// Balances held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<String, f64>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_balance(&self, user_id: &str, amount: f64) {
        self.balances
            .lock()
            .await
            .insert(user_id.to_string(), amount);
    }
}

impl CreditLedger for InMemoryCreditLedger {
    fn balance<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, f64> {
        Box::pin(async move {
            let balances = self.balances.lock().await;
            Ok(balances.get(user_id).copied().unwrap_or(0.0))
        })
    }

    fn deduct<'a>(&'a self, user_id: &'a str, amount: f64) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(user_id.to_string()).or_insert(0.0);
            if *balance < amount {
                debug!(
                    "Deduction of {:.2} refused for {}: balance {:.2}",
                    amount, user_id, balance
                );
                return Ok(false);
            }
            *balance -= amount;
            Ok(true)
        })
    }
}

/// A ledger that never runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmeteredLedger;

impl CreditLedger for UnmeteredLedger {
    fn balance<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, f64> {
        Box::pin(async { Ok(f64::INFINITY) })
    }

    fn deduct<'a>(&'a self, _user_id: &'a str, _amount: f64) -> BoxFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}
