//! AMQP (RabbitMQ) broker client.
//!
//! One `Client` owns one logical broker connection: a session factory
//! supervising the physical link, at most one producer, and one consumer
//! per exchange. Workers claim sessions from the factory and never dial
//! on their own, so publishing and consuming resume transparently after
//! an outage. With `dedicated_connection` each worker gets a private
//! factory instead of the shared one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lapin::types::{AMQPValue, FieldTable};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::correlation::{Completion, CorrelationStore, Outcome};
use super::{BusError, DoneHandle, MessageHandler, RequestContext, Result};
use crate::codec;
use crate::config::BrokerConfig;
use crate::retry::ReconnectPolicy;

mod consumer;
mod dialer;
mod producer;

pub use consumer::{Consumer, ConsumerOptions, SubscriptionDescriptor};
pub use dialer::{Dialer, LinkState};
pub use producer::{Producer, ProducerOptions, ReadySignal};

use producer::PendingSend;

struct WorkerEntry<T> {
    worker: Arc<T>,
    shutdown: CancellationToken,
}

/// Broker client facade.
pub struct Client {
    tag: String,
    fingerprint: String,
    config: BrokerConfig,
    dialer: Arc<Dialer>,
    store: Arc<CorrelationStore>,
    producer: RwLock<Option<WorkerEntry<Producer>>>,
    consumers: RwLock<HashMap<String, WorkerEntry<Consumer>>>,
    shutdown: CancellationToken,
}

impl Client {
    /// Build a client and, unless each worker brings its own connection,
    /// start supervising the shared one.
    pub fn connect(tag: impl Into<String>, config: BrokerConfig) -> Arc<Self> {
        let tag = tag.into().to_lowercase();
        let shutdown = CancellationToken::new();
        let dialer = Arc::new(Dialer::new(tag.clone(), shutdown.child_token()));

        if config.enable && !config.dedicated_connection {
            Self::supervise(Arc::clone(&dialer), config.clone());
        }

        debug!(
            client = %tag,
            host = %config.host,
            port = config.port,
            "broker client registered"
        );

        Arc::new(Self {
            fingerprint: config.fingerprint(),
            tag,
            config,
            dialer,
            store: Arc::new(CorrelationStore::new()),
            producer: RwLock::new(None),
            consumers: RwLock::new(HashMap::new()),
            shutdown,
        })
    }

    /// Run a dialer until shutdown or retry exhaustion.
    fn supervise(dialer: Arc<Dialer>, config: BrokerConfig) {
        tokio::spawn(async move {
            let policy = ReconnectPolicy::from_config(&config);
            if let Err(e) = dialer.run(&config, policy).await {
                error!(error = %e, "broker connection abandoned, retry budget exhausted");
            }
        });
    }

    /// Tag this client registered under.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Connection-target fingerprint, the registry key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Snapshot of the shared link state.
    pub fn is_connected(&self) -> bool {
        self.dialer.is_connected()
    }

    /// Start the producer worker.
    ///
    /// The returned signal resolves once the first session has been
    /// prepared; `push` before that buffers rather than fails.
    pub async fn start_producer(&self, options: ProducerOptions) -> Result<ReadySignal> {
        if !self.config.enable {
            return Err(BusError::Disabled);
        }
        let shutdown = self.shutdown.child_token();
        let dialer = self.worker_dialer("producer");
        let producer = Producer::new(self.tag.clone(), options, dialer, shutdown.clone());
        let signal = producer.ready_signal();
        producer.spawn();

        let mut slot = self.producer.write().await;
        if let Some(previous) = slot.replace(WorkerEntry {
            worker: producer,
            shutdown,
        }) {
            previous.shutdown.cancel();
            warn!(client = %self.tag, "replaced existing producer registration");
        }
        Ok(signal)
    }

    /// Register a consumer for an exchange.
    ///
    /// A second registration for the same exchange replaces the first;
    /// the old worker is cancelled before the new one takes over.
    pub async fn start_consumer(
        &self,
        options: ConsumerOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if !self.config.enable {
            return Err(BusError::Disabled);
        }
        if options.exchange.is_empty() {
            return Err(BusError::Topology("exchange is required".to_string()));
        }
        let exchange = options.exchange.clone();
        let shutdown = self.shutdown.child_token();
        let dialer = self.worker_dialer(&exchange);
        let consumer = Consumer::new(
            self.tag.clone(),
            options,
            handler,
            dialer,
            Arc::clone(&self.store),
            shutdown.clone(),
        );
        consumer.spawn();

        let mut consumers = self.consumers.write().await;
        if let Some(previous) = consumers.insert(
            exchange.clone(),
            WorkerEntry {
                worker: consumer,
                shutdown,
            },
        ) {
            previous.shutdown.cancel();
            warn!(client = %self.tag, exchange = %exchange, "replaced existing consumer registration");
        }
        Ok(())
    }

    /// Publish a typed value.
    ///
    /// Returns `NotReady` before `start_producer`. With a callback the
    /// call blocks until the correlated reply fires the callback or
    /// `ctx.cancel` aborts the wait; the correlation entry is released on
    /// either outcome.
    pub async fn push<T: Serialize>(
        &self,
        ctx: RequestContext,
        id: &str,
        key: &str,
        body: &T,
        callback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<()> {
        let producer = self.current_producer().await?;
        let id = ensure_id(id);
        let payload = codec::encode(producer.encoding(), body)?;
        self.push_inner(ctx, producer, id, key, payload, callback)
            .await
    }

    /// Publish pre-encoded bytes (the `Raw` and `Proto` encodings).
    ///
    /// Under `Proto` the bytes are sealed in an envelope carrying the
    /// message id.
    pub async fn push_bytes(
        &self,
        ctx: RequestContext,
        id: &str,
        key: &str,
        bytes: Vec<u8>,
        callback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<()> {
        let producer = self.current_producer().await?;
        let id = ensure_id(id);
        let payload = match producer.encoding() {
            crate::codec::Encoding::Proto => codec::seal(&id, bytes),
            _ => bytes,
        };
        self.push_inner(ctx, producer, id, key, payload, callback)
            .await
    }

    async fn push_inner(
        &self,
        ctx: RequestContext,
        producer: Arc<Producer>,
        id: String,
        key: &str,
        payload: Vec<u8>,
        callback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<()> {
        let send = PendingSend {
            id: id.clone(),
            key: key.to_string(),
            payload,
            headers: ctx.trace.clone(),
        };
        let Some(callback) = callback else {
            return producer.submit(send).await;
        };

        let (handle, completion) = Completion::pair(ctx.cancel.clone());
        self.store.put(&id, handle);
        if let Err(e) = producer.submit(send).await {
            self.store.remove(&id);
            return Err(e);
        }
        let outcome = completion.wait().await;
        self.store.remove(&id);
        if let Outcome::Completed(message) = outcome {
            let done = DoneHandle::new(ctx.cancel);
            callback.handle(message, done).await;
        }
        Ok(())
    }

    /// Stop the supervisor and every worker. Pending session offers are
    /// abandoned; buffered sends are dropped with the workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!(client = %self.tag, "broker client shut down");
    }

    async fn current_producer(&self) -> Result<Arc<Producer>> {
        let slot = self.producer.read().await;
        slot.as_ref()
            .map(|entry| Arc::clone(&entry.worker))
            .ok_or(BusError::NotReady("producer"))
    }

    fn worker_dialer(&self, label: &str) -> Arc<Dialer> {
        if !self.config.dedicated_connection {
            return Arc::clone(&self.dialer);
        }
        let dialer = Arc::new(Dialer::new(
            format!("{}-{}", self.tag, label),
            self.shutdown.child_token(),
        ));
        Self::supervise(Arc::clone(&dialer), self.config.clone());
        dialer
    }

    #[cfg(test)]
    pub(crate) fn correlation_len(&self) -> usize {
        self.store.len()
    }
}

fn ensure_id(id: &str) -> String {
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

/// Convert string headers into an AMQP field table.
pub(crate) fn field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in headers {
        table.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    FieldTable::from(table)
}

/// Extract the string-valued entries of an AMQP field table.
pub(crate) fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (key, value) in table.inner() {
        if let AMQPValue::LongString(text) = value {
            if let Ok(text) = std::str::from_utf8(text.as_bytes()) {
                headers.insert(key.as_str().to_string(), text.to_string());
            }
        }
    }
    headers
}
