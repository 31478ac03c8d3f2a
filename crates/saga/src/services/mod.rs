//! External service traits used by the order fulfillment saga, with
//! in-memory implementations for tests and local runs.
//!
//! Every call carries the step's idempotency key. The in-memory services
//! answer a repeated key with the original result instead of creating a
//! second reservation, charge or shipment.

pub mod inventory;
pub mod payment;
pub mod shipping;

use common::ErrorKind;

pub use inventory::{InMemoryInventoryService, InventoryService, ReservationResult};
pub use payment::{InMemoryPaymentService, PaymentResult, PaymentService};
pub use shipping::{InMemoryShippingService, ShipmentResult, ShippingService};

/// Injected failure behaviour for an in-memory service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Every call fails with this kind.
    Always(ErrorKind),
    /// The next `n` calls fail with this kind, then calls succeed.
    Times(u32, ErrorKind),
}

#[derive(Debug, Default)]
struct Fault(Option<FailureMode>);

impl Fault {
    fn set(&mut self, mode: Option<FailureMode>) {
        self.0 = mode;
    }

    /// Returns the kind to fail with for this call, if any.
    fn trip(&mut self) -> Option<ErrorKind> {
        match self.0 {
            Some(FailureMode::Always(kind)) => Some(kind),
            Some(FailureMode::Times(remaining, kind)) if remaining > 0 => {
                self.0 = (remaining > 1).then_some(FailureMode::Times(remaining - 1, kind));
                Some(kind)
            }
            _ => None,
        }
    }
}
