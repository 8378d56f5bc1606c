//! Broker messaging primitives.
//!
//! This module contains:
//! - `BusError`: error taxonomy shared by the broker workers
//! - `MessageHandler` trait: for processing deliveries and replies
//! - `InboundMessage`, `RequestContext`, `DoneHandle`: the delivery surface
//! - `correlation`: publish-and-await completion store
//! - `amqp`: the RabbitMQ client, session factory, and workers

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecError, Encoding, Envelope};

pub mod amqp;
pub mod correlation;

pub use amqp::{Client, ConsumerOptions, ProducerOptions, ReadySignal, SubscriptionDescriptor};
pub use correlation::{CorrelationStore, Outcome};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("topology setup failed: {0}")]
    Topology(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("{0} not ready")]
    NotReady(&'static str),

    #[error("pending buffer full, {0} messages waiting")]
    PendingOverflow(usize),

    #[error("broker disabled in configuration")]
    Disabled,
}

impl From<CodecError> for BusError {
    fn from(err: CodecError) -> Self {
        BusError::Encoding(err.to_string())
    }
}

/// Per-call context carried across a publish: an external cancellation
/// signal plus trace metadata copied into the outbound message headers.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Cancels a blocking publish-with-callback from the outside.
    pub cancel: CancellationToken,
    /// Trace metadata propagated as message headers.
    pub trace: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach one trace entry.
    pub fn with_trace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace.insert(key.into(), value.into());
        self
    }
}

/// One delivery handed to a consumer callback or returned to a waiting
/// publish call.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    exchange: String,
    routing_key: String,
    id: String,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
    encoding: Encoding,
}

impl InboundMessage {
    pub(crate) fn new(
        exchange: String,
        routing_key: String,
        id: String,
        headers: BTreeMap<String, String>,
        payload: Vec<u8>,
        encoding: Encoding,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            id,
            headers,
            payload,
            encoding,
        }
    }

    /// Exchange the message arrived through.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Message identifier, empty when the publisher supplied none.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// String-valued message headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Raw payload bytes as they arrived.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Request context recovered from the message headers.
    pub fn context(&self) -> RequestContext {
        RequestContext {
            cancel: CancellationToken::new(),
            trace: self.headers.clone(),
        }
    }

    /// Decode the payload per the subscription's encoding.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, CodecError> {
        codec::decode(self.encoding, &self.payload)
    }

    /// Open the protobuf envelope of a [`Encoding::Proto`] payload.
    pub fn envelope(&self) -> std::result::Result<Envelope, CodecError> {
        codec::unseal(&self.payload)
    }
}

/// Completion control handed to a callback alongside each message.
///
/// Both operations fire at most once between them; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct DoneHandle {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl DoneHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the request this message belongs to.
    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.token.cancel();
        }
    }

    /// Mark the request finished, releasing whoever is waiting on it.
    pub fn end_request(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.token.cancel();
        }
    }

    /// Whether either hook has fired.
    pub fn is_finished(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Handler for messages delivered by a consumer or correlated replies.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    fn handle(&self, message: InboundMessage, done: DoneHandle) -> BoxFuture<'static, ()>;
}
