//! Callback correlation store.
//!
//! Maps an outbound message id to a single-fire completion so a
//! publish-and-await call can block until the downstream reply arrives or
//! the caller's cancellation token fires. An entry never outlives its
//! owning call: it is removed on fire or cancellation, whichever first.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::InboundMessage;

/// How a [`Completion`] resolved.
#[derive(Debug)]
pub enum Outcome {
    /// The correlated reply arrived.
    Completed(InboundMessage),
    /// The caller's cancellation token fired first, or the entry was
    /// discarded without ever firing.
    Cancelled,
}

/// Firing side of a completion. Consumed by the first fire.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<InboundMessage>,
}

impl CompletionHandle {
    /// Deliver the reply. Returns false when the waiting side is gone.
    pub fn fire(self, message: InboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Waiting side of a completion: a single-fire promise with an attached
/// cancellation token.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<InboundMessage>,
    cancel: CancellationToken,
}

impl Completion {
    /// Create a linked handle/completion pair.
    pub fn pair(cancel: CancellationToken) -> (CompletionHandle, Completion) {
        let (tx, rx) = oneshot::channel();
        (CompletionHandle { tx }, Completion { rx, cancel })
    }

    /// Block until the reply fires or the token cancels.
    pub async fn wait(self) -> Outcome {
        tokio::select! {
            message = self.rx => match message {
                Ok(message) => Outcome::Completed(message),
                Err(_) => Outcome::Cancelled,
            },
            _ = self.cancel.cancelled() => Outcome::Cancelled,
        }
    }
}

/// Id-keyed store of pending completions, one lock around every access.
#[derive(Debug, Default)]
pub struct CorrelationStore {
    entries: Mutex<HashMap<String, CompletionHandle>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion under the given message id.
    pub fn put(&self, id: &str, handle: CompletionHandle) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(id.to_string(), handle);
    }

    /// Fire and remove the entry for `id`. Returns true when an entry
    /// existed and its waiter was still listening.
    pub fn complete(&self, id: &str, message: InboundMessage) -> bool {
        let handle = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(id)
        };
        match handle {
            Some(handle) => handle.fire(message),
            None => false,
        }
    }

    /// Drop the entry for `id`, if any.
    pub fn remove(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(id);
    }

    /// Whether an entry exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    /// Number of pending completions.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::codec::Encoding;

    fn reply(id: &str) -> InboundMessage {
        InboundMessage::new(
            "orders".to_string(),
            String::new(),
            id.to_string(),
            BTreeMap::new(),
            b"{}".to_vec(),
            Encoding::Json,
        )
    }

    #[tokio::test]
    async fn test_complete_fires_waiter_and_clears_entry() {
        let store = CorrelationStore::new();
        let (handle, completion) = Completion::pair(CancellationToken::new());
        store.put("m-1", handle);

        assert!(store.complete("m-1", reply("m-1")));
        assert!(!store.contains("m-1"));

        match completion.wait().await {
            Outcome::Completed(message) => assert_eq!(message.id(), "m-1"),
            Outcome::Cancelled => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiter() {
        let store = CorrelationStore::new();
        let token = CancellationToken::new();
        let (handle, completion) = Completion::pair(token.clone());
        store.put("m-2", handle);

        token.cancel();
        assert!(matches!(completion.wait().await, Outcome::Cancelled));

        // The owning call removes the entry after either outcome.
        store.remove("m-2");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_complete_unknown_id_is_noop() {
        let store = CorrelationStore::new();
        assert!(!store.complete("nope", reply("nope")));
    }

    #[tokio::test]
    async fn test_dropped_handle_resolves_cancelled() {
        let store = CorrelationStore::new();
        let (handle, completion) = Completion::pair(CancellationToken::new());
        store.put("m-3", handle);
        store.remove("m-3");
        assert!(matches!(completion.wait().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_fire_after_waiter_gone_reports_false() {
        let (handle, completion) = Completion::pair(CancellationToken::new());
        drop(completion);
        assert!(!handle.fire(reply("m-4")));
    }
}
