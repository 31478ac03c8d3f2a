//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use super::{FailureMode, Fault};
use crate::step::StepError;

/// Result of a successful shipment booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentResult {
    /// The tracking ID assigned by the carrier.
    pub tracking_id: String,
}

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Books a shipment for an order.
    async fn book(
        &self,
        idempotency_key: &str,
        order_id: &str,
    ) -> Result<ShipmentResult, StepError>;

    /// Cancels a booked shipment. Cancelling an unknown shipment succeeds.
    async fn cancel(&self, idempotency_key: &str, tracking_id: &str) -> Result<(), StepError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, String>,
    by_key: HashMap<String, String>,
    next_id: u32,
    book_calls: usize,
    cancel_calls: usize,
    book_fault: Fault,
    cancel_fault: Fault,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryShippingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_book_failure(&self, mode: Option<FailureMode>) {
        self.state().book_fault.set(mode);
    }

    pub fn set_cancel_failure(&self, mode: Option<FailureMode>) {
        self.state().cancel_fault.set(mode);
    }

    pub fn shipment_count(&self) -> usize {
        self.state().shipments.len()
    }

    pub fn has_shipment(&self, tracking_id: &str) -> bool {
        self.state().shipments.contains_key(tracking_id)
    }

    pub fn book_calls(&self) -> usize {
        self.state().book_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.state().cancel_calls
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn book(
        &self,
        idempotency_key: &str,
        order_id: &str,
    ) -> Result<ShipmentResult, StepError> {
        let mut state = self.state();
        state.book_calls += 1;

        if let Some(kind) = state.book_fault.trip() {
            return Err(StepError::new(kind, "carrier unavailable"));
        }
        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(ShipmentResult {
                tracking_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let tracking_id = format!("TRACK-{:04}", state.next_id);
        state
            .shipments
            .insert(tracking_id.clone(), order_id.to_string());
        state
            .by_key
            .insert(idempotency_key.to_string(), tracking_id.clone());

        Ok(ShipmentResult { tracking_id })
    }

    async fn cancel(&self, idempotency_key: &str, tracking_id: &str) -> Result<(), StepError> {
        let mut state = self.state();
        state.cancel_calls += 1;

        if let Some(kind) = state.cancel_fault.trip() {
            return Err(StepError::new(kind, "carrier unavailable"));
        }

        state.shipments.remove(tracking_id);
        state.by_key.remove(idempotency_key);
        Ok(())
    }
}
