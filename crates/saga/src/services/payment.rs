//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use super::{FailureMode, Fault};
use crate::step::StepError;

/// Result of a successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    /// The transaction ID assigned by the payment service.
    pub transaction_id: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order.
    async fn charge(
        &self,
        idempotency_key: &str,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<PaymentResult, StepError>;

    /// Refunds a previous charge. Refunding an unknown or already refunded
    /// transaction succeeds.
    async fn refund(&self, idempotency_key: &str, transaction_id: &str) -> Result<(), StepError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (String, String, u64)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    charge_calls: usize,
    refund_calls: usize,
    charge_fault: Fault,
    refund_fault: Fault,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_charge_failure(&self, mode: Option<FailureMode>) {
        self.state().charge_fault.set(mode);
    }

    pub fn set_refund_failure(&self, mode: Option<FailureMode>) {
        self.state().refund_fault.set(mode);
    }

    /// Returns the number of charges not refunded.
    pub fn payment_count(&self) -> usize {
        self.state().payments.len()
    }

    /// Returns true if a charge exists with the given transaction ID.
    pub fn has_payment(&self, transaction_id: &str) -> bool {
        self.state().payments.contains_key(transaction_id)
    }

    pub fn charge_calls(&self) -> usize {
        self.state().charge_calls
    }

    pub fn refund_calls(&self) -> usize {
        self.state().refund_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        idempotency_key: &str,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<PaymentResult, StepError> {
        let mut state = self.state();
        state.charge_calls += 1;

        if let Some(kind) = state.charge_fault.trip() {
            return Err(StepError::new(kind, "payment declined"));
        }
        if amount_cents == 0 {
            return Err(StepError::validation("charge amount must be positive"));
        }
        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(PaymentResult {
                transaction_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let transaction_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            transaction_id.clone(),
            (order_id.to_string(), customer_id.to_string(), amount_cents),
        );
        state
            .by_key
            .insert(idempotency_key.to_string(), transaction_id.clone());

        Ok(PaymentResult { transaction_id })
    }

    async fn refund(&self, idempotency_key: &str, transaction_id: &str) -> Result<(), StepError> {
        let mut state = self.state();
        state.refund_calls += 1;

        if let Some(kind) = state.refund_fault.trip() {
            return Err(StepError::new(kind, "refund rejected"));
        }

        state.payments.remove(transaction_id);
        state.by_key.remove(idempotency_key);
        Ok(())
    }
}
