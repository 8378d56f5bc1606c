//! Consumer worker.
//!
//! Maintains exactly one subscription described by an immutable
//! descriptor. Every fresh session gets the identical declare/bind/consume
//! sequence, so the observed topology is stable across reconnects. Any
//! error on the way, and the end of the delivery stream, mark the worker
//! unsubscribed and route reconnection through the session factory.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::super::correlation::CorrelationStore;
use super::super::{BusError, DoneHandle, InboundMessage, MessageHandler, Result};
use super::dialer::{Dialer, LinkState, Session};
use super::string_headers;
use crate::codec::{self, Encoding};
use crate::config::short_hash;

/// Concurrent dispatch floor when multi-threaded delivery is enabled.
const MIN_DISPATCH_LIMIT: usize = 10;

/// Options for registering a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Exchange the subscription belongs to. Required.
    pub exchange: String,
    /// Explicit queue name; derived from exchange and routing key when
    /// absent.
    pub queue: Option<String>,
    /// Binding key; without one the queue is declared but not bound.
    pub routing_key: Option<String>,
    pub durable: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    /// Encoding deliveries are decoded with.
    pub encoding: Encoding,
    /// Fan deliveries out to the handler concurrently.
    pub multi_thread: bool,
    /// Concurrency bound for multi-threaded dispatch.
    pub limiter: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            queue: None,
            routing_key: None,
            durable: false,
            auto_delete: false,
            no_wait: false,
            encoding: Encoding::default(),
            multi_thread: false,
            limiter: MIN_DISPATCH_LIMIT,
        }
    }
}

/// The frozen shape of one subscription, re-applied verbatim on every
/// reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub exchange: String,
    pub queue: String,
    pub routing_key: Option<String>,
    pub durable: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
}

impl SubscriptionDescriptor {
    fn from_options(options: &ConsumerOptions) -> Self {
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| derived_queue(&options.exchange, options.routing_key.as_deref()));
        Self {
            exchange: options.exchange.clone(),
            queue,
            routing_key: options.routing_key.clone(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            no_wait: options.no_wait,
        }
    }
}

/// Deterministic queue name for a subscription without an explicit one.
pub(crate) fn derived_queue(exchange: &str, routing_key: Option<&str>) -> String {
    match routing_key {
        Some(key) => short_hash(&[exchange, key]),
        None => short_hash(&[exchange]),
    }
}

/// Subscription worker surviving reconnects transparently.
pub struct Consumer {
    label: String,
    descriptor: SubscriptionDescriptor,
    encoding: Encoding,
    multi_thread: bool,
    limit: Arc<Semaphore>,
    handler: Arc<dyn MessageHandler>,
    dialer: Arc<Dialer>,
    store: Arc<CorrelationStore>,
    shutdown: CancellationToken,
}

impl Consumer {
    pub(crate) fn new(
        label: impl Into<String>,
        options: ConsumerOptions,
        handler: Arc<dyn MessageHandler>,
        dialer: Arc<Dialer>,
        store: Arc<CorrelationStore>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let descriptor = SubscriptionDescriptor::from_options(&options);
        Arc::new(Self {
            label: label.into(),
            descriptor,
            encoding: options.encoding,
            multi_thread: options.multi_thread,
            limit: Arc::new(Semaphore::new(options.limiter.max(MIN_DISPATCH_LIMIT))),
            handler,
            dialer,
            store,
            shutdown,
        })
    }

    /// The subscription shape this worker re-applies each epoch.
    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    /// Spawn the session-claiming loop.
    pub(crate) fn spawn(self: &Arc<Self>) {
        let consumer = Arc::clone(self);
        tokio::spawn(consumer.run());
    }

    async fn run(self: Arc<Self>) {
        let mut state = self.dialer.subscribe();
        let mut last_epoch = 0u64;
        loop {
            let snapshot = *state.borrow_and_update();
            if let LinkState::Connected(epoch) = snapshot {
                if epoch > last_epoch {
                    match self.dialer.session().await {
                        Ok(session) => {
                            last_epoch = epoch;
                            match self.subscribe_session(&session).await {
                                Ok(deliveries) => {
                                    match &self.descriptor.routing_key {
                                        Some(key) => info!(
                                            exchange = %self.descriptor.exchange,
                                            routing_key = %key,
                                            queue = %self.descriptor.queue,
                                            "subscribed"
                                        ),
                                        None => info!(
                                            exchange = %self.descriptor.exchange,
                                            queue = %self.descriptor.queue,
                                            "subscribed"
                                        ),
                                    }
                                    self.pump(deliveries).await;
                                    if self.shutdown.is_cancelled() {
                                        return;
                                    }
                                    warn!(
                                        consumer = %self.label,
                                        queue = %self.descriptor.queue,
                                        "subscription ended, awaiting fresh session"
                                    );
                                    self.dialer.report_failure(epoch);
                                }
                                Err(e) => {
                                    error!(
                                        consumer = %self.label,
                                        error = %e,
                                        "failed to apply subscription"
                                    );
                                    self.dialer.report_failure(epoch);
                                }
                            }
                        }
                        Err(e) => {
                            debug!(consumer = %self.label, error = %e, "no session this epoch");
                        }
                    }
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Declare the queue, bind it when a routing key exists, and open the
    /// delivery stream. Declaring an existing queue with identical
    /// parameters succeeds, so reapplication is safe.
    async fn subscribe_session(&self, session: &Session) -> Result<lapin::Consumer> {
        let descriptor = &self.descriptor;
        session
            .channel
            .queue_declare(
                &descriptor.queue,
                QueueDeclareOptions {
                    durable: descriptor.durable,
                    auto_delete: descriptor.auto_delete,
                    nowait: descriptor.no_wait,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("cannot declare queue {:?}: {e}", descriptor.queue))
            })?;

        if let Some(routing_key) = &descriptor.routing_key {
            session
                .channel
                .queue_bind(
                    &descriptor.queue,
                    &descriptor.exchange,
                    routing_key,
                    QueueBindOptions {
                        nowait: descriptor.no_wait,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Topology(format!(
                        "cannot bind queue to exchange {:?}: {e}",
                        descriptor.exchange
                    ))
                })?;
        }

        session
            .channel
            .basic_consume(
                &descriptor.queue,
                &format!("{}-consumer", self.label),
                BasicConsumeOptions {
                    nowait: descriptor.no_wait,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("cannot consume from {:?}: {e}", descriptor.queue))
            })
    }

    /// Forward deliveries until the stream ends or shutdown fires.
    async fn pump(&self, mut deliveries: lapin::Consumer) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.deliver(delivery).await,
                    Some(Err(e)) => {
                        error!(consumer = %self.label, error = %e, "delivery stream error");
                        return;
                    }
                    None => {
                        debug!(consumer = %self.label, "delivery stream closed");
                        return;
                    }
                }
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(string_headers)
            .unwrap_or_default();
        let mut id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        // Proto payloads are sealed in an envelope; a delivery that does
        // not parse is rejected rather than requeued or silently dropped.
        if self.encoding == Encoding::Proto {
            match codec::unseal(&delivery.data) {
                Ok(envelope) => {
                    if id.is_empty() {
                        id = envelope.id;
                    }
                }
                Err(e) => {
                    error!(consumer = %self.label, error = %e, "rejecting undecodable delivery");
                    if let Err(e) = delivery.reject(BasicRejectOptions::default()).await {
                        error!(consumer = %self.label, error = %e, "failed to reject delivery");
                    }
                    return;
                }
            }
        }

        let message = InboundMessage::new(
            delivery.exchange.to_string(),
            delivery.routing_key.to_string(),
            id.clone(),
            headers,
            delivery.data.clone(),
            self.encoding,
        );

        // A correlated reply satisfies a waiting publish call instead of
        // the registered handler.
        if !id.is_empty() && self.store.complete(&id, message.clone()) {
            debug!(consumer = %self.label, id = %id, "completed correlated request");
        } else {
            let done = DoneHandle::new(self.shutdown.child_token());
            if self.multi_thread {
                if let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await {
                    let work = self.handler.handle(message, done);
                    tokio::spawn(async move {
                        work.await;
                        drop(permit);
                    });
                }
            } else {
                self.handler.handle(message, done).await;
            }
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(consumer = %self.label, error = %e, "failed to ack delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    struct NoopHandler;

    impl MessageHandler for NoopHandler {
        fn handle(&self, _message: InboundMessage, _done: DoneHandle) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn consumer_with(options: ConsumerOptions) -> Arc<Consumer> {
        Consumer::new(
            "test",
            options,
            Arc::new(NoopHandler),
            Arc::new(Dialer::new("test", CancellationToken::new())),
            Arc::new(CorrelationStore::new()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_derived_queue_is_deterministic() {
        let first = derived_queue("orders", None);
        let second = derived_queue("orders", None);
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn test_derived_queue_tracks_routing_key() {
        assert_ne!(
            derived_queue("orders", None),
            derived_queue("orders", Some("orders.created"))
        );
        assert_ne!(derived_queue("orders", None), derived_queue("billing", None));
    }

    #[test]
    fn test_descriptor_uses_explicit_queue_when_given() {
        let consumer = consumer_with(ConsumerOptions {
            exchange: "orders".to_string(),
            queue: Some("orders-inbox".to_string()),
            ..Default::default()
        });
        assert_eq!(consumer.descriptor().queue, "orders-inbox");
    }

    #[test]
    fn test_descriptor_derives_queue_from_exchange() {
        let consumer = consumer_with(ConsumerOptions {
            exchange: "orders".to_string(),
            ..Default::default()
        });
        assert_eq!(consumer.descriptor().queue, derived_queue("orders", None));
        // Registering again with the same options yields the identical
        // descriptor, which is what keeps resubscription idempotent.
        let again = consumer_with(ConsumerOptions {
            exchange: "orders".to_string(),
            ..Default::default()
        });
        assert_eq!(consumer.descriptor(), again.descriptor());
    }

    #[test]
    fn test_dispatch_limit_has_floor() {
        let consumer = consumer_with(ConsumerOptions {
            exchange: "orders".to_string(),
            multi_thread: true,
            limiter: 2,
            ..Default::default()
        });
        assert_eq!(consumer.limit.available_permits(), MIN_DISPATCH_LIMIT);
    }
}
