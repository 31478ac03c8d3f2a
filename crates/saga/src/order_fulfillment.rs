//! The order fulfillment saga: reserve stock, charge the customer, book a
//! shipment.
//!
//! If a step fails, completed steps are undone in reverse order: the
//! shipment is cancelled, the charge refunded, the reservation released.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::retry::RetryPolicy;
use crate::services::{InventoryService, PaymentService, ShippingService};
use crate::step::{SagaStep, StepCall, StepError};

/// The saga name for order fulfillment.
pub const SAGA_NAME: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Charge the customer.
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";

/// Step name: Book a shipment with the carrier.
pub const STEP_BOOK_SHIPMENT: &str = "book_shipment";

/// One product line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: u32,
}

/// Context threaded through the order fulfillment steps.
///
/// Each step fills in the identifier it obtained and its compensation
/// clears it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
    pub amount_cents: u64,
    #[serde(default)]
    pub reservation_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub tracking_id: Option<String>,
}

impl OrderContext {
    pub fn new(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        items: Vec<OrderLine>,
        amount_cents: u64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            items,
            amount_cents,
            reservation_id: None,
            transaction_id: None,
            tracking_id: None,
        }
    }
}

/// Reserves stock; compensation releases it.
pub struct ReserveInventory {
    inventory: Arc<dyn InventoryService>,
}

impl ReserveInventory {
    pub fn new(inventory: Arc<dyn InventoryService>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl SagaStep<OrderContext> for ReserveInventory {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if ctx.reservation_id.is_some() {
            return Ok(());
        }
        let result = self
            .inventory
            .reserve(&call.idempotency_key(), &ctx.order_id, &ctx.items)
            .await?;
        ctx.reservation_id = Some(result.reservation_id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if let Some(reservation_id) = ctx.reservation_id.take() {
            self.inventory
                .release(&call.idempotency_key(), &reservation_id)
                .await?;
        }
        Ok(())
    }
}

/// Charges the customer; compensation refunds the charge.
pub struct ChargePayment {
    payment: Arc<dyn PaymentService>,
}

impl ChargePayment {
    pub fn new(payment: Arc<dyn PaymentService>) -> Self {
        Self { payment }
    }
}

#[async_trait]
impl SagaStep<OrderContext> for ChargePayment {
    fn name(&self) -> &str {
        STEP_CHARGE_PAYMENT
    }

    async fn execute(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if ctx.transaction_id.is_some() {
            return Ok(());
        }
        let result = self
            .payment
            .charge(
                &call.idempotency_key(),
                &ctx.order_id,
                &ctx.customer_id,
                ctx.amount_cents,
            )
            .await?;
        ctx.transaction_id = Some(result.transaction_id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if let Some(transaction_id) = ctx.transaction_id.take() {
            self.payment
                .refund(&call.idempotency_key(), &transaction_id)
                .await?;
        }
        Ok(())
    }
}

/// Books the shipment; compensation cancels it.
pub struct BookShipment {
    shipping: Arc<dyn ShippingService>,
}

impl BookShipment {
    pub fn new(shipping: Arc<dyn ShippingService>) -> Self {
        Self { shipping }
    }
}

#[async_trait]
impl SagaStep<OrderContext> for BookShipment {
    fn name(&self) -> &str {
        STEP_BOOK_SHIPMENT
    }

    async fn execute(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if ctx.tracking_id.is_some() {
            return Ok(());
        }
        let result = self
            .shipping
            .book(&call.idempotency_key(), &ctx.order_id)
            .await?;
        ctx.tracking_id = Some(result.tracking_id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OrderContext, call: &StepCall) -> Result<(), StepError> {
        if let Some(tracking_id) = ctx.tracking_id.take() {
            self.shipping
                .cancel(&call.idempotency_key(), &tracking_id)
                .await?;
        }
        Ok(())
    }
}

/// Builds the order fulfillment definition over the given services.
pub fn definition(
    inventory: Arc<dyn InventoryService>,
    payment: Arc<dyn PaymentService>,
    shipping: Arc<dyn ShippingService>,
    retry: RetryPolicy,
) -> crate::error::Result<SagaDefinition<OrderContext>> {
    SagaDefinition::builder(SAGA_NAME)
        .retry_policy(retry)
        .step(ReserveInventory::new(inventory))
        .step(ChargePayment::new(payment))
        .step(BookShipment::new(shipping))
        .build()
}
