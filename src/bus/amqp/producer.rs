//! Producer worker.
//!
//! Holds at most one live session. Sends submitted while disconnected
//! queue up in a bounded FIFO buffer; every session acquisition first
//! declares the topology, then replays the whole buffer in submission
//! order before new submits are accepted. The buffer and the live session
//! share one async mutex, which is what preserves ordering across the
//! disconnect/reconnect boundary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::super::{BusError, Result};
use super::dialer::{Dialer, LinkState, Session};
use super::field_table;
use crate::codec::{self, Encoding};

/// Options for starting a producer.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Exchange to publish through. Empty selects default-exchange mode:
    /// the destination queue is declared and published to directly.
    pub exchange: String,
    /// Exchange kind declared on session acquisition.
    pub exchange_type: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    /// Payload encoding applied by `push`.
    pub encoding: Encoding,
    /// Pending buffer capacity; submissions beyond it are refused.
    pub pending_capacity: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_type: "direct".to_string(),
            durable: false,
            auto_delete: false,
            no_wait: false,
            encoding: Encoding::default(),
            pending_capacity: 1024,
        }
    }
}

/// One outbound message waiting for a live session.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub id: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Resolves once the producer has prepared its first session.
#[derive(Debug, Clone)]
pub struct ReadySignal(watch::Receiver<bool>);

impl ReadySignal {
    /// Wait until the producer is ready to hand sends to the broker.
    pub async fn wait(mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.0.borrow()
    }
}

struct ProducerInner {
    session: Option<Session>,
    pending: VecDeque<PendingSend>,
}

/// Ordered, at-least-once publisher over one broker connection.
pub struct Producer {
    label: String,
    options: ProducerOptions,
    dialer: Arc<Dialer>,
    inner: Mutex<ProducerInner>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Producer {
    pub(crate) fn new(
        label: impl Into<String>,
        options: ProducerOptions,
        dialer: Arc<Dialer>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            label: label.into(),
            options,
            dialer,
            inner: Mutex::new(ProducerInner {
                session: None,
                pending: VecDeque::new(),
            }),
            ready,
            shutdown,
        })
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.options.encoding
    }

    pub(crate) fn ready_signal(&self) -> ReadySignal {
        ReadySignal(self.ready.subscribe())
    }

    /// Spawn the session-claiming loop.
    pub(crate) fn spawn(self: &Arc<Self>) {
        let producer = Arc::clone(self);
        tokio::spawn(producer.run());
    }

    async fn run(self: Arc<Self>) {
        let mut state = self.dialer.subscribe();
        let mut last_epoch = 0u64;
        loop {
            let snapshot = *state.borrow_and_update();
            match snapshot {
                LinkState::Connected(epoch) if epoch > last_epoch => {
                    match self.dialer.session().await {
                        Ok(session) => {
                            last_epoch = epoch;
                            if let Err(e) = self.attach(session).await {
                                error!(
                                    producer = %self.label,
                                    error = %e,
                                    "failed to attach publish session"
                                );
                                self.dialer.report_failure(epoch);
                            }
                        }
                        Err(e) => {
                            debug!(producer = %self.label, error = %e, "no session this epoch");
                        }
                    }
                }
                LinkState::Disconnected | LinkState::Closing => {
                    let mut inner = self.inner.lock().await;
                    if inner.session.take().is_some() {
                        debug!(producer = %self.label, "publish session released");
                    }
                }
                _ => {}
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

    /// Prepare a fresh session and replay the pending buffer through it.
    async fn attach(&self, session: Session) -> Result<()> {
        self.prepare(&session).await?;
        let mut inner = self.inner.lock().await;
        let backlog = inner.pending.len();
        while let Some(send) = inner.pending.pop_front() {
            if let Err(e) = Self::dispatch(&session, &self.options, &send).await {
                // Not handed to the broker; back to the head so order holds.
                inner.pending.push_front(send);
                inner.session = None;
                return Err(e);
            }
            trace!(producer = %self.label, id = %send.id, "replayed buffered message");
        }
        if backlog > 0 {
            debug!(producer = %self.label, backlog, "pending buffer drained");
        }
        inner.session = Some(session);
        drop(inner);
        self.ready.send_replace(true);
        Ok(())
    }

    /// Declare topology and enable publisher confirms.
    async fn prepare(&self, session: &Session) -> Result<()> {
        if !self.options.exchange.is_empty() {
            session
                .channel
                .exchange_declare(
                    &self.options.exchange,
                    exchange_kind(&self.options.exchange_type),
                    ExchangeDeclareOptions {
                        durable: self.options.durable,
                        auto_delete: self.options.auto_delete,
                        nowait: self.options.no_wait,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Topology(format!("failed to declare exchange: {e}")))?;
        }
        if let Err(e) = session
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            warn!(producer = %self.label, error = %e, "publisher confirms not supported");
        }
        Ok(())
    }

    /// Publish now when a session is live, buffer otherwise.
    ///
    /// Buffered submissions return success; the caller finds out about an
    /// outage only when the buffer overflows or the connection has been
    /// abandoned for good.
    pub(crate) async fn submit(&self, send: PendingSend) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.take() {
            match Self::dispatch(&session, &self.options, &send).await {
                Ok(()) => {
                    inner.session = Some(session);
                    Ok(())
                }
                Err(e) => {
                    error!(
                        producer = %self.label,
                        id = %send.id,
                        error = %e,
                        "publish on live session failed"
                    );
                    self.dialer.report_failure(session.epoch);
                    Err(e)
                }
            }
        } else {
            if let Some(err) = self.dialer.terminal_error() {
                return Err(err);
            }
            if inner.pending.len() >= self.options.pending_capacity {
                return Err(BusError::PendingOverflow(inner.pending.len()));
            }
            warn!(
                producer = %self.label,
                id = %send.id,
                "not connected to broker, buffering message"
            );
            inner.pending.push_back(send);
            Ok(())
        }
    }

    /// Hand one message to the broker and track its confirmation.
    async fn dispatch(
        session: &Session,
        options: &ProducerOptions,
        send: &PendingSend,
    ) -> Result<()> {
        let (exchange, key) = if options.exchange.is_empty() {
            ("", send.key.as_str())
        } else {
            let key = if send.key.is_empty() {
                options.exchange.as_str()
            } else {
                send.key.as_str()
            };
            (options.exchange.as_str(), key)
        };

        // Default-exchange mode publishes straight to a queue; declaring it
        // per send is idempotent and keeps the destination alive.
        if exchange.is_empty() {
            session
                .channel
                .queue_declare(
                    key,
                    QueueDeclareOptions {
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        nowait: options.no_wait,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Topology(format!("failed to declare queue: {e}")))?;
        }

        let mut properties = BasicProperties::default()
            .with_content_type(codec::content_type(options.encoding).into())
            .with_message_id(send.id.as_str().into());
        if options.durable {
            properties = properties.with_delivery_mode(2);
        }
        if !send.headers.is_empty() {
            properties = properties.with_headers(field_table(&send.headers));
        }

        let confirm = session
            .channel
            .basic_publish(
                exchange,
                key,
                BasicPublishOptions::default(),
                &send.payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("failed to publish: {e}")))?;

        // Confirmation failures are warnings, not resends: delivery is
        // at-least-once and the broker already has the message.
        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                warn!(id = %send.id, key = %key, "failed delivery confirmation")
            }
            Ok(_) => trace!(id = %send.id, key = %key, "message handed to broker"),
            Err(e) => warn!(id = %send.id, error = %e, "publish confirmation failed"),
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn pending_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.pending.iter().map(|send| send.id.clone()).collect()
    }
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}
