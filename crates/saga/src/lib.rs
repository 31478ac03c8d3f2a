//! Saga orchestration engine.
//!
//! A saga is an ordered list of steps, each paired with a compensating
//! action. The [`SagaExecutor`] runs the steps in order, checkpointing the
//! run record after every attempt so that a crashed process can resume
//! where it left off. When a step fails for good, the steps that already
//! completed are compensated in strict reverse order.
//!
//! The [`order_fulfillment`] module holds a complete saga built on the
//! engine:
//! 1. Reserve inventory
//! 2. Charge payment
//! 3. Book shipment

pub mod client;
pub mod definition;
pub mod error;
pub mod executor;
pub mod lease;
pub mod order_fulfillment;
pub mod retry;
pub mod services;
pub mod step;

pub use client::SagaClient;
pub use definition::{DefinitionRegistry, SagaDefinition, SagaDefinitionBuilder};
pub use error::{Result, SagaError};
pub use executor::{ExecutorConfig, RunOutcome, RunReport, SagaExecutor};
pub use lease::{ActiveRuns, Claim};
pub use order_fulfillment::{OrderContext, OrderLine};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryPolicyError};
pub use run_store::{RunStatus, StepFailure, StepStatus};
pub use services::{
    FailureMode, InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService,
    InventoryService, PaymentService, ShippingService,
};
pub use step::{SagaContext, SagaStep, StepCall, StepError};
