//! External services called by the order fulfillment saga.

pub mod inventory;
pub mod payment;
pub mod shipping;

pub use inventory::{InMemoryInventoryService, InventoryService, ReservationItem};
pub use payment::{InMemoryPaymentService, Payment, PaymentService};
pub use shipping::{InMemoryShippingService, ShippingService};
