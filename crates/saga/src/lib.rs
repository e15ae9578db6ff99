//! Saga orchestration over the message bus.
//!
//! The orchestrator keeps one [`SagaInstance`] per running saga, publishes a
//! command for the step at the head of its remaining list, and advances when
//! the participant reports completion. When a step fails, every step before
//! it is compensated in reverse order.
//!
//! The order fulfillment saga follows these steps:
//! 1. Reserve inventory
//! 2. Process payment (through a circuit breaker)
//! 3. Create shipment

pub mod error;
pub mod events;
pub mod instance;
pub mod order_fulfillment;
pub mod orchestrator;
pub mod participants;
pub mod registry;
pub mod state;

pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use instance::{SagaInstance, SagaView};
pub use order_fulfillment::{FulfillmentData, FulfillmentParticipants, OrderLine, OrderRequest};
pub use orchestrator::{SagaOrchestrator, StepReportHandler};
pub use participants::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService, InventoryService,
    ParticipantHandler, PaymentService, ShippingService, StepParticipant, install_participant,
};
pub use registry::{SagaRegistry, SagaStats};
pub use state::SagaStatus;
