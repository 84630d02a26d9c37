use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    client::{ClientError, circuit::CircuitRequest},
    pvdata::{ChangeBitSet, FieldLayout, PvStructure},
};

/// Publishes a value both as a stream of changes and as a current value
#[derive(Debug, Clone)]
pub struct SenderPair<T>
where
    T: Clone,
{
    pub broadcast: broadcast::Sender<T>,
    pub watch: watch::Sender<T>,
}

impl<T> SenderPair<T>
where
    T: Clone,
{
    pub fn new(capacity: usize, initial: T) -> Self {
        Self {
            broadcast: broadcast::Sender::new(capacity),
            watch: watch::Sender::new(initial),
        }
    }

    /// Attempt to send a value to all receivers, and return the number of listeners
    ///
    /// The current value is always updated, even with nobody watching.
    pub fn send(&self, value: T) -> usize {
        let broadcast = self.broadcast.send(value.clone()).unwrap_or(0);
        self.watch.send_replace(value);
        broadcast + self.watch.receiver_count()
    }

    pub fn current(&self) -> T {
        self.watch.borrow().clone()
    }

    pub fn subscribe(&self) -> (broadcast::Receiver<T>, watch::Receiver<T>) {
        (self.broadcast.subscribe(), self.watch.subscribe())
    }
}

/// A new value from a monitored channel
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorUpdate {
    /// The full (requested) value, with the update applied
    pub value: PvStructure,
    /// Leaf fields that changed in this update
    pub changed: ChangeBitSet,
    /// Leaf fields that changed more than once since the previous update
    pub overrun: ChangeBitSet,
}

impl MonitorUpdate {
    pub fn changed_paths(&self) -> Vec<String> {
        self.paths(&self.changed)
    }

    pub fn overrun_paths(&self) -> Vec<String> {
        self.paths(&self.overrun)
    }

    /// True if intermediate values were coalesced into this update
    pub fn has_overrun(&self) -> bool {
        !self.overrun.is_empty()
    }

    fn paths(&self, bits: &ChangeBitSet) -> Vec<String> {
        FieldLayout::of(self.value.structure_desc())
            .changed_paths(bits)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Debug)]
pub enum MonitorEvent {
    Update(MonitorUpdate),
    /// The connection to the server was lost. The subscription restarts,
    /// with a fresh initial value, once the channel reconnects.
    Disconnected,
    /// The subscription could not be (re)started
    Error(ClientError),
    /// The server ended the subscription
    Finished,
}

/// Sends window refills for one monitor
#[derive(Debug, Clone)]
pub(crate) struct Acknowledger {
    pub requests: mpsc::UnboundedSender<CircuitRequest>,
    pub ioid: u32,
    pub window: u32,
}

impl Acknowledger {
    fn acknowledge(&self, count: u32) {
        trace!("Releasing {count} updates on monitor {}", self.ioid);
        let _ = self.requests.send(CircuitRequest::MonitorAck {
            ioid: self.ioid,
            count,
        });
    }
}

#[derive(Debug)]
pub(crate) struct Delivery {
    pub event: MonitorEvent,
    /// The first value after (re)starting, which is outside the window
    pub initial: bool,
    pub ack: Option<Acknowledger>,
}

impl From<MonitorEvent> for Delivery {
    fn from(event: MonitorEvent) -> Self {
        Delivery {
            event,
            initial: false,
            ack: None,
        }
    }
}

/// A stream of updates from a channel.
///
/// Updates are delivered in the order the server sent them. With a pipeline
/// window, the server only sends more once earlier updates are consumed here,
/// so a slow reader slows the server down rather than losing track of
/// values; anything the server had to skip is flagged in
/// [`MonitorUpdate::overrun`].
#[derive(Debug)]
pub struct Subscription {
    name: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    /// Updates consumed since the last acknowledgement
    consumed: u32,
    close: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        name: &str,
        receiver: mpsc::UnboundedReceiver<Delivery>,
        close: CancellationToken,
    ) -> Self {
        Subscription {
            name: name.to_owned(),
            receiver,
            consumed: 0,
            close,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event. Returns `None` once the subscription is over.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        let delivery = self.receiver.recv().await?;
        if let Some(ack) = &delivery.ack {
            if delivery.initial {
                self.consumed = 0;
            } else {
                self.consumed += 1;
                if self.consumed * 2 >= ack.window {
                    ack.acknowledge(self.consumed);
                    self.consumed = 0;
                }
            }
        }
        Some(delivery.event)
    }

    /// Wait for the next value, skipping connection events
    pub async fn next_update(&mut self) -> Option<MonitorUpdate> {
        loop {
            match self.recv().await? {
                MonitorEvent::Update(update) => return Some(update),
                MonitorEvent::Finished => return None,
                _ => continue,
            }
        }
    }

    /// Stop the subscription. Safe to call any number of times, including
    /// after the server has ended it.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// A token that closes this subscription when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::{ScalarType, Structure, StructureDesc, TypeDescriptor};

    fn update(value: f64) -> MonitorEvent {
        let desc = StructureDesc::new("").field("value", TypeDescriptor::Scalar(ScalarType::Double));
        MonitorEvent::Update(MonitorUpdate {
            value: PvStructure::new(desc, Structure::new().with("value", value)).unwrap(),
            changed: [1].into_iter().collect(),
            overrun: ChangeBitSet::new(),
        })
    }

    #[test]
    fn test_sender_pair_tracks_current() {
        let pair = SenderPair::new(4, 1u8);
        let (mut changes, current) = pair.subscribe();
        assert_eq!(pair.send(2), 2);
        assert_eq!(*current.borrow(), 2);
        assert_eq!(changes.try_recv().unwrap(), 2);
        drop(changes);
        drop(current);
        assert_eq!(pair.send(3), 0);
        assert_eq!(pair.current(), 3);
    }

    #[tokio::test]
    async fn test_acknowledges_after_half_window() {
        let (requests, mut circuit) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = Subscription::new("demo", rx, CancellationToken::new());
        let ack = Acknowledger {
            requests,
            ioid: 7,
            window: 4,
        };
        for n in 0..5 {
            tx.send(Delivery {
                event: update(n as f64),
                initial: n == 0,
                ack: Some(ack.clone()),
            })
            .unwrap();
        }
        // Initial value, then one update: nothing to release yet
        subscription.recv().await.unwrap();
        subscription.recv().await.unwrap();
        assert!(circuit.try_recv().is_err());
        subscription.recv().await.unwrap();
        match circuit.try_recv() {
            Ok(CircuitRequest::MonitorAck { ioid: 7, count: 2 }) => (),
            other => panic!("Expected acknowledgement, got {:?}", other.is_ok()),
        }
        subscription.recv().await.unwrap();
        assert!(circuit.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut subscription = Subscription::new("demo", rx, token.clone());
        tx.send(MonitorEvent::Finished.into()).unwrap();
        assert!(subscription.next_update().await.is_none());
        subscription.close();
        subscription.close();
        assert!(subscription.is_closed());
        assert!(token.is_cancelled());
        drop(tx);
        assert!(subscription.recv().await.is_none());
    }

    #[test]
    fn test_update_paths() {
        let MonitorEvent::Update(update) = update(1.0) else {
            unreachable!()
        };
        assert_eq!(update.changed_paths(), vec!["value".to_string()]);
        assert!(!update.has_overrun());
    }
}
