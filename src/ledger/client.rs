use std::sync::Arc;

use tracing::{error, info, warn};

use super::store::{LedgerMutation, LedgerOutcome, LedgerStore};

/// key: credits-ledger-client -> balance reads and idempotent mutations
///
/// Never reads-then-writes a balance; every mutation is a single call the
/// external store applies atomically.
#[derive(Clone)]
pub struct CreditsLedgerClient {
    store: Arc<dyn LedgerStore>,
}

impl CreditsLedgerClient {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Fail-open: unknown users and unreachable stores read as `0.0`.
    pub async fn get_balance(&self, user_id: &str) -> f64 {
        match self.store.balance(user_id).await {
            Ok(Some(balance)) => balance,
            Ok(None) => 0.0,
            Err(err) => {
                warn!(?err, %user_id, "balance read failed; treating balance as 0");
                0.0
            }
        }
    }

    pub async fn debit(
        &self,
        user_id: &str,
        amount: f64,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> LedgerOutcome {
        let Some(mutation) = build_mutation(user_id, amount, reason, idempotency_key) else {
            return LedgerOutcome::failed("debit amount must be a positive number");
        };
        let outcome = match self.store.debit(&mutation).await {
            Ok(outcome) => outcome,
            Err(err) => LedgerOutcome::failed(format!("{err:#}")),
        };
        log_outcome("debit", &mutation, &outcome);
        outcome
    }

    pub async fn credit(
        &self,
        user_id: &str,
        amount: f64,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> LedgerOutcome {
        let Some(mutation) = build_mutation(user_id, amount, reason, idempotency_key) else {
            return LedgerOutcome::failed("credit amount must be a positive number");
        };
        let outcome = match self.store.credit(&mutation).await {
            Ok(outcome) => outcome,
            Err(err) => LedgerOutcome::failed(format!("{err:#}")),
        };
        log_outcome("credit", &mutation, &outcome);
        outcome
    }
}

fn build_mutation(
    user_id: &str,
    amount: f64,
    reason: &str,
    idempotency_key: Option<&str>,
) -> Option<LedgerMutation> {
    if !amount.is_finite() || amount <= 0.0 {
        return None;
    }
    Some(LedgerMutation {
        user_id: user_id.to_string(),
        amount,
        reason: reason.to_string(),
        idempotency_key: idempotency_key.map(str::to_string),
    })
}

fn log_outcome(kind: &str, mutation: &LedgerMutation, outcome: &LedgerOutcome) {
    if outcome.success {
        info!(
            kind,
            user_id = %mutation.user_id,
            amount = mutation.amount,
            reason = %mutation.reason,
            transaction_id = outcome.transaction_id.as_deref().unwrap_or(""),
            "ledger mutation applied"
        );
    } else if outcome.duplicate {
        warn!(
            kind,
            user_id = %mutation.user_id,
            idempotency_key = mutation.idempotency_key.as_deref().unwrap_or(""),
            "ledger store deduplicated mutation"
        );
    } else {
        error!(
            kind,
            user_id = %mutation.user_id,
            amount = mutation.amount,
            reason = %mutation.reason,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "ledger mutation failed"
        );
    }
}
