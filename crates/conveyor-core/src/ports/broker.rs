//! Broker port - durable, prioritised, routed message transport.
//!
//! The broker routes a message to the queue named by its routing key (one
//! queue per stage). Publishing is confirmed: `publish` resolves only once the
//! broker has taken responsibility for the message. Consumption is bounded by
//! a prefetch budget of unsettled deliveries per consumer.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{BrokerError, Priority};

/// A message as handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Mirrored at transport level so the queue can order by it.
    pub priority: Priority,
    /// Survive a broker restart.
    pub persistent: bool,
    /// Report an unbound routing key as unroutable instead of dropping.
    pub mandatory: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a queue bound to the routing key of the same name.
    ///
    /// Re-declaring with the same `max_priority` is a no-op.
    async fn declare_queue(&self, name: &str, max_priority: u8) -> Result<(), BrokerError>;

    /// Publishes and waits for the confirm.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Opens a consumer on `queue` holding at most `prefetch` unsettled
    /// deliveries. A prefetch of 0 means unbounded.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>, BrokerError>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery. `None` once the broker is closed.
    async fn next(&mut self) -> Option<Box<dyn Delivery>>;
}

/// One delivery of a message to a consumer.
///
/// Settling consumes the delivery. A delivery dropped without being settled
/// goes back to its queue.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// 1 on first delivery, incremented on each requeue.
    fn attempt(&self) -> u32;

    fn queue(&self) -> &str;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Puts the message back, visible again after `delay`.
    async fn requeue(self: Box<Self>, delay: Duration) -> Result<(), BrokerError>;

    /// Parks the message where it is never delivered again.
    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), BrokerError>;
}
