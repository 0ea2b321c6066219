// Frame consumer module
// Sink for decoded pictures plus per-frame events

use crate::decoder::{DecodeFailure, DecodedImage, FatalError, Token};
use crate::pool::SlotHandle;
use crossbeam_channel::{Receiver, Sender};

/// A decoded picture handed to the consumer.
///
/// The consumer owns the pool slot until it calls [`DeliveredFrame::release`],
/// which must happen exactly once, after presentation.
#[derive(Debug)]
pub struct DeliveredFrame {
    pub token: Token,
    /// Presentation time in microseconds
    pub pts: i64,
    /// Duration in microseconds
    pub duration: i64,
    slot: SlotHandle,
}

impl DeliveredFrame {
    pub(crate) fn new(token: Token, pts: i64, duration: i64, slot: SlotHandle) -> Self {
        Self {
            token,
            pts,
            duration,
            slot,
        }
    }

    pub fn image(&self) -> Option<&DecodedImage> {
        self.slot.image()
    }

    pub fn slot_index(&self) -> usize {
        self.slot.index()
    }

    /// Return the slot to the pool
    pub fn release(self) {
        self.slot.release();
    }

    /// Keep the slot handle, dropping the timing metadata
    pub fn into_slot(self) -> SlotHandle {
        self.slot
    }
}

/// Why a frame will never be delivered
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The runtime reported a decode error for the sample
    DecodeFailed(DecodeFailure),
    /// The session refused the sample at submission
    Rejected(String),
}

/// Per-frame and lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Dropped {
        token: Token,
        pts: i64,
        reason: DropReason,
    },
    /// Every sample has been submitted and resolved
    EndOfStream,
    /// Playback cannot continue
    Fatal(FatalError),
}

/// Receives decoded frames, possibly on the decoder's completion thread
pub trait FrameConsumer: Send + Sync {
    /// Take ownership of a decoded frame
    fn deliver(&self, frame: DeliveredFrame);

    /// Observe a dropped frame or a lifecycle change
    fn on_event(&self, _event: FrameEvent) {}
}

/// Message sent by [`ChannelConsumer`]
#[derive(Debug)]
pub enum ConsumerMessage {
    Frame(DeliveredFrame),
    Event(FrameEvent),
}

/// Consumer that forwards everything to another thread
#[derive(Clone)]
pub struct ChannelConsumer {
    tx: Sender<ConsumerMessage>,
}

/// Create a channel-backed consumer and the receiving end for the display thread
pub fn channel_consumer() -> (ChannelConsumer, Receiver<ConsumerMessage>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ChannelConsumer { tx }, rx)
}

impl FrameConsumer for ChannelConsumer {
    fn deliver(&self, frame: DeliveredFrame) {
        // Nobody will ever present it: give the slot back right away
        if let Err(err) = self.tx.send(ConsumerMessage::Frame(frame)) {
            if let ConsumerMessage::Frame(frame) = err.into_inner() {
                log::warn!("Consumer gone, releasing frame {}", frame.token);
                frame.release();
            }
        }
    }

    fn on_event(&self, event: FrameEvent) {
        let _ = self.tx.send(ConsumerMessage::Event(event));
    }
}
