//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use super::{FailureMode, Fault};
use crate::order_fulfillment::OrderLine;
use crate::step::StepError;

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for the given order lines.
    async fn reserve(
        &self,
        idempotency_key: &str,
        order_id: &str,
        items: &[OrderLine],
    ) -> Result<ReservationResult, StepError>;

    /// Releases a previously made reservation. Releasing an unknown or
    /// already released reservation succeeds.
    async fn release(&self, idempotency_key: &str, reservation_id: &str) -> Result<(), StepError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (String, Vec<OrderLine>)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    reserve_calls: usize,
    release_calls: usize,
    reserve_fault: Fault,
    release_fault: Fault,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `reserve` fail as described, or clears the failure.
    pub fn set_reserve_failure(&self, mode: Option<FailureMode>) {
        self.state().reserve_fault.set(mode);
    }

    /// Makes `release` fail as described, or clears the failure.
    pub fn set_release_failure(&self, mode: Option<FailureMode>) {
        self.state().release_fault.set(mode);
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.state().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state().reservations.contains_key(reservation_id)
    }

    /// Number of `reserve` calls received, failed ones included.
    pub fn reserve_calls(&self) -> usize {
        self.state().reserve_calls
    }

    /// Number of `release` calls received, failed ones included.
    pub fn release_calls(&self) -> usize {
        self.state().release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        idempotency_key: &str,
        order_id: &str,
        items: &[OrderLine],
    ) -> Result<ReservationResult, StepError> {
        let mut state = self.state();
        state.reserve_calls += 1;

        if let Some(kind) = state.reserve_fault.trip() {
            return Err(StepError::new(kind, "inventory service failure"));
        }
        if items.is_empty() {
            return Err(StepError::validation("order has no items to reserve"));
        }
        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(ReservationResult {
                reservation_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            (order_id.to_string(), items.to_vec()),
        );
        state
            .by_key
            .insert(idempotency_key.to_string(), reservation_id.clone());

        Ok(ReservationResult { reservation_id })
    }

    async fn release(&self, idempotency_key: &str, reservation_id: &str) -> Result<(), StepError> {
        let mut state = self.state();
        state.release_calls += 1;

        if let Some(kind) = state.release_fault.trip() {
            return Err(StepError::new(kind, "inventory service failure"));
        }

        state.reservations.remove(reservation_id);
        state.by_key.remove(idempotency_key);
        Ok(())
    }
}
