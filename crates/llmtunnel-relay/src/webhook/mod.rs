//! Signed, retried delivery of lifecycle events to user-registered HTTP
//! endpoints.

pub mod delivery;
pub mod event;
pub mod matcher;
pub mod signature;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod delivery_tests;

pub use delivery::{
    DeliveryStatus, WebhookDelivery, WebhookDeliveryService, WebhookError, WebhookInput,
    WebhookRegistration, WebhookUpdate,
};
pub use event::{EventPublisher, WebhookEvent};
pub use matcher::{EventMatcher, FilterOperator, MatcherCache, PropertyFilter};
