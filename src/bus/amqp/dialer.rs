//! Session factory for the broker connection.
//!
//! One `Dialer` owns one physical connection. Its supervisor loop dials,
//! broadcasts the link state through a watch channel, and mints
//! channel-scoped sessions for workers while the connection holds. Loss
//! tears the epoch down and re-dials after the configured delay; dial
//! failures consume the reconnect policy's budget until it refuses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::super::{BusError, Result};
use crate::config::BrokerConfig;
use crate::retry::ReconnectPolicy;

/// Connection lifecycle states broadcast to workers.
///
/// `Connected` carries the epoch: the generation number of the current
/// physical connection. Workers track the last epoch they served so one
/// epoch hands each of them at most one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected(u64),
    Closing,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected(_))
    }

    pub fn epoch(&self) -> Option<u64> {
        match self {
            LinkState::Connected(epoch) => Some(*epoch),
            _ => None,
        }
    }
}

/// A usable handle bound to one connection epoch: a dedicated AMQP channel
/// for declaring topology, publishing, and consuming. Never shared between
/// workers; each claims its own from the factory.
pub(crate) struct Session {
    pub channel: Channel,
    pub epoch: u64,
}

/// Owner of the physical broker connection.
pub struct Dialer {
    label: String,
    state: watch::Sender<LinkState>,
    conn: Mutex<Option<Connection>>,
    epoch: AtomicU64,
    /// Highest epoch reported dead, by the transport or by a worker.
    loss: watch::Sender<u64>,
    terminal: OnceLock<BusError>,
    shutdown: CancellationToken,
}

impl Dialer {
    pub fn new(label: impl Into<String>, shutdown: CancellationToken) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (loss, _) = watch::channel(0);
        Self {
            label: label.into(),
            state,
            conn: Mutex::new(None),
            epoch: AtomicU64::new(0),
            loss,
            terminal: OnceLock::new(),
            shutdown,
        }
    }

    /// Subscribe to link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Synchronized snapshot of the link state.
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// The error that ended the supervisor loop, once the reconnect
    /// policy refused further attempts.
    pub fn terminal_error(&self) -> Option<BusError> {
        self.terminal.get().cloned()
    }

    /// Mint a fresh channel-scoped session off the live connection.
    ///
    /// Requesters that ask while disconnected get `NotReady` back and are
    /// expected to wait for the next `Connected` broadcast. A channel
    /// creation failure cancels the whole epoch.
    pub(crate) async fn session(&self) -> Result<Session> {
        let Some(epoch) = self.state.borrow().epoch() else {
            return Err(BusError::NotReady("connection"));
        };
        let guard = self.conn.lock().await;
        let Some(conn) = guard.as_ref() else {
            return Err(BusError::NotReady("connection"));
        };
        match conn.create_channel().await {
            Ok(channel) => Ok(Session { channel, epoch }),
            Err(e) => {
                drop(guard);
                error!(client = %self.label, error = %e, "failed to open channel, cancelling epoch");
                self.report_failure(epoch);
                Err(BusError::Connection(format!(
                    "failed to create channel: {e}"
                )))
            }
        }
    }

    /// Worker-observed death of a session belonging to `epoch`. Tears the
    /// epoch down so the supervisor re-dials; stale reports from older
    /// epochs are ignored.
    pub(crate) fn report_failure(&self, epoch: u64) {
        self.loss.send_if_modified(|current| {
            if epoch > *current {
                *current = epoch;
                true
            } else {
                false
            }
        });
    }

    /// Supervisor loop: dial, serve one epoch, tear down, repeat.
    ///
    /// Returns `Ok(())` on shutdown. Returns the last dial error once the
    /// reconnect policy refuses further attempts; that error is also kept
    /// as [`terminal_error`](Self::terminal_error) for later callers.
    pub async fn run(&self, config: &BrokerConfig, mut policy: ReconnectPolicy) -> Result<()> {
        let url = config.url();
        loop {
            if self.shutdown.is_cancelled() {
                self.state.send_replace(LinkState::Disconnected);
                return Ok(());
            }
            self.state.send_replace(LinkState::Connecting);
            let connected = tokio::select! {
                result = Connection::connect(&url, ConnectionProperties::default()) => result,
                _ = self.shutdown.cancelled() => {
                    self.state.send_replace(LinkState::Disconnected);
                    return Ok(());
                }
            };
            match connected {
                Ok(conn) => {
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    conn.on_error({
                        let loss = self.loss.clone();
                        let label = self.label.clone();
                        move |err| {
                            error!(client = %label, error = %err, "transport error");
                            loss.send_if_modified(|current| {
                                if epoch > *current {
                                    *current = epoch;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                    });
                    *self.conn.lock().await = Some(conn);
                    self.state.send_replace(LinkState::Connected(epoch));
                    info!(
                        client = %self.label,
                        host = %config.host,
                        port = config.port,
                        epoch,
                        "connected to broker"
                    );

                    let mut loss_rx = self.loss.subscribe();
                    tokio::select! {
                        _ = loss_rx.wait_for(|&lost| lost >= epoch) => {
                            self.teardown().await;
                            let delay = config.reconnect_delay();
                            warn!(client = %self.label, delay = ?delay, "connection lost, reconnecting after delay");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.shutdown.cancelled() => return Ok(()),
                            }
                            info!(client = %self.label, "reconnecting now");
                        }
                        _ = self.shutdown.cancelled() => {
                            self.state.send_replace(LinkState::Closing);
                            self.teardown().await;
                            debug!(client = %self.label, "session factory shut down");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Disconnected);
                    error!(client = %self.label, error = %e, "broker dial failed");
                    let err = BusError::Connection(e.to_string());
                    if let Err(err) = policy.pause(err).await {
                        let _ = self.terminal.set(err.clone());
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn teardown(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            let _ = conn.close(200, "closing").await;
        }
        self.state.send_replace(LinkState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_session_refused_before_any_connection() {
        let dialer = Dialer::new("test", CancellationToken::new());
        assert!(!dialer.is_connected());
        assert!(matches!(
            dialer.session().await,
            Err(BusError::NotReady("connection"))
        ));
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let dialer = Dialer::new("test", CancellationToken::new());
        assert_eq!(*dialer.subscribe().borrow(), LinkState::Disconnected);
        assert!(dialer.terminal_error().is_none());
    }

    #[tokio::test]
    async fn test_dial_failures_exhaust_policy_and_surface_error() {
        // Nothing listens on this port; each dial fails fast.
        let config = BrokerConfig {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            auto_reconnect: true,
            ..Default::default()
        };
        let dialer = Dialer::new("test", CancellationToken::new());
        let policy = ReconnectPolicy::new(true, Duration::from_millis(10), 3);

        let result = dialer.run(&config, policy).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert!(dialer.terminal_error().is_some());
        assert_eq!(*dialer.subscribe().borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_dial_failure_without_auto_reconnect_is_terminal() {
        let config = BrokerConfig {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let dialer = Dialer::new("test", CancellationToken::new());
        let policy = ReconnectPolicy::new(false, Duration::from_millis(10), 5);

        assert!(dialer.run(&config, policy).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_supervisor() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let config = BrokerConfig {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let dialer = Dialer::new("test", shutdown);
        let policy = ReconnectPolicy::new(true, Duration::from_millis(10), 3);
        assert!(dialer.run(&config, policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_failure_report_is_ignored() {
        let dialer = Dialer::new("test", CancellationToken::new());
        dialer.report_failure(3);
        dialer.report_failure(1);
        assert_eq!(*dialer.loss.subscribe().borrow(), 3);
    }
}
