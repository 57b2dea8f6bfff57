//! Fire-and-forget message transport and its in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::messaging::{Endpoint, Message};
use crate::utils::FailoverError;

use parking_lot::RwLock;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::mpsc;

/// Outbound side of the network. Sends never block and never report
/// delivery; reliability comes from the retry pipeline.
pub trait MessageTransport: Send + Sync {
    fn send(&self, to: Endpoint, message: Message);
}

/// Predicate deciding whether a message to an endpoint gets dropped.
pub type DropFilter = Arc<dyn Fn(&Endpoint, &Message) -> bool + Send + Sync>;

/// In-process network connecting registered endpoints through unbounded
/// channels. Messages go through an rmp-serde encode/decode pass like they
/// would on a real wire.
#[derive(Default)]
pub struct InMemoryNetwork {
    /// Map from endpoint -> sender side of its inbox.
    inboxes: RwLock<HashMap<Endpoint, mpsc::UnboundedSender<Message>>>,

    drop_filter: RwLock<Option<DropFilter>>,

    sent: AtomicUsize,
    dropped: AtomicUsize,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an endpoint and returns its inbox. Re-registering replaces
    /// the previous inbox, as a restarted node would.
    pub fn register(&self, endpoint: Endpoint) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(endpoint, tx);
        rx
    }

    /// Removes an endpoint; messages to it are dropped from now on.
    pub fn unregister(&self, endpoint: &Endpoint) {
        self.inboxes.write().remove(endpoint);
    }

    pub fn is_registered(&self, endpoint: &Endpoint) -> bool {
        self.inboxes.read().contains_key(endpoint)
    }

    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.drop_filter.write() = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.write() = None;
    }

    /// Number of messages delivered to an inbox.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Number of messages dropped by the filter or for lack of a receiver.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn wire_pass(message: &Message) -> Result<Message, FailoverError> {
        let bytes = encode_to_vec(message)?;
        Ok(decode_from_slice(&bytes)?)
    }
}

impl MessageTransport for InMemoryNetwork {
    fn send(&self, to: Endpoint, message: Message) {
        if let Some(filter) = self.drop_filter.read().as_ref() {
            if filter(&to, &message) {
                pf_trace!("net"; "dropped {} to {}", message, to);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let message = match Self::wire_pass(&message) {
            Ok(m) => m,
            Err(e) => {
                pf_error!("net"; "error encoding {}: {}", message, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let delivered = match self.inboxes.read().get(&to) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if delivered {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            pf_debug!("net"; "no receiver for {}", to);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
