//! Messaging primitives built on the bus: publishers, subscriber, responder.

mod ordered;
mod publisher;
mod responder;
mod subscriber;

pub use ordered::{OrderedBusPublisher, OrderedPublisher, OrderedPublisherConfig, PubFuture};
pub use publisher::{BusPublisher, Publisher, PublisherConfig};
pub use responder::{RequestHandler, Responder};
pub use subscriber::{Subscriber, SubscriberConfig};

use crate::envelope::{Message, KEY_MESSAGE_ID, KEY_MESSAGE_TYPE};
use crate::error::Result;
use crate::bus::BusMessage;
use async_trait::async_trait;

/// Processes inbound data-plane messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Messages for which this returns false are acknowledged without handling.
    fn should_process(&self, _message: &Message) -> bool {
        true
    }

    async fn handle_message(&self, message: &Message) -> Result<()>;
}

/// Observes messages after successful handling.
pub trait ProcessingNotifier: Send + Sync {
    fn on_processed(&self, message: &Message);
}

/// Encode an envelope into a bus message, mirroring type and id as headers.
pub(crate) fn to_bus_message(subject: &str, message: &Message) -> Result<BusMessage> {
    let mut bus_message = BusMessage::new(subject, message.encode()?);
    for key in [KEY_MESSAGE_TYPE, KEY_MESSAGE_ID] {
        if let Some(value) = message.metadata_value(key) {
            bus_message = bus_message.with_header(key, value);
        }
    }
    Ok(bus_message)
}
