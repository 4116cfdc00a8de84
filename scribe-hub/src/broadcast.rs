//! Fan-out of encoded frames to room members.
//!
//! Each connection owns a bounded outbox. A message is encoded once and the
//! same `Arc` frame is pushed into every recipient's outbox with `try_send`,
//! so a relay never waits on a slow or vanished peer: a full outbox drops
//! the frame, a closed one is skipped. [`Broadcaster::fan_out_report`] tells
//! the caller which recipients overflowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Encoded wire frame shared between all recipients.
pub type Frame = Arc<Vec<u8>>;

/// Result of pushing one frame into one outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Outbox full, frame dropped.
    Full,
    /// Receiver gone (connection lost).
    Closed,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    /// Recipients whose outbox was full; the frame never reached them.
    pub overflowed: Vec<Uuid>,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: Uuid,
    sender: mpsc::Sender<Frame>,
}

impl Outbox {
    /// Create an outbox and the receiver the gateway drains.
    pub fn channel(connection_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                connection_id,
                sender,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Non-blocking push.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        match self.sender.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// Encodes server messages and pushes them into outboxes.
///
/// Shared by every room; it holds no membership of its own. Callers pass
/// the recipient list they computed under the room lock.
pub struct Broadcaster {
    stats: Arc<AtomicBroadcastStats>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Send a message to a single connection.
    pub fn unicast(&self, outbox: &Outbox, msg: &ServerMessage) -> Result<Delivery, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(self.push(outbox, frame, msg))
    }

    /// Send a message to every outbox in `recipients`, in iteration order.
    ///
    /// The message is encoded once. Returns the number of outboxes that
    /// accepted the frame.
    pub fn fan_out<'a, I>(&self, recipients: I, msg: &ServerMessage) -> Result<usize, ProtocolError>
    where
        I: IntoIterator<Item = &'a Outbox>,
    {
        self.fan_out_report(recipients, msg).map(|report| report.delivered)
    }

    /// Like [`Broadcaster::fan_out`], but also names the recipients that
    /// lost the frame to a full outbox.
    pub fn fan_out_report<'a, I>(
        &self,
        recipients: I,
        msg: &ServerMessage,
    ) -> Result<FanOut, ProtocolError>
    where
        I: IntoIterator<Item = &'a Outbox>,
    {
        let frame = Arc::new(msg.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut report = FanOut::default();
        for outbox in recipients {
            match self.push(outbox, frame.clone(), msg) {
                Delivery::Sent => report.delivered += 1,
                Delivery::Full => report.overflowed.push(outbox.connection_id()),
                Delivery::Closed => {}
            }
        }
        Ok(report)
    }

    fn push(&self, outbox: &Outbox, frame: Frame, msg: &ServerMessage) -> Delivery {
        let delivery = outbox.deliver(frame);
        match delivery {
            Delivery::Sent => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Full => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Outbox of {} is full, dropped {} frame",
                    outbox.connection_id(),
                    msg.kind()
                );
            }
            Delivery::Closed => {
                log::debug!(
                    "Outbox of {} is closed, skipped {} frame",
                    outbox.connection_id(),
                    msg.kind()
                );
            }
        }
        delivery
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
