//! Event source port.
//!
//! The kernel driver (or tracepoint pipe) lives outside this crate; the
//! producer thread drains whatever implements [`EventSource`]. A source
//! error is fatal to that source - the producer loop stops draining it.

use std::sync::mpsc;
use std::time::Duration;

use super::Event;

/// One pull from an event source.
#[derive(Debug)]
pub enum SourceItem {
    /// An event was available.
    Event(Event),
    /// Nothing available within the source's internal deadline.
    Timeout,
    /// The source is exhausted and will never produce again.
    Eof,
}

/// Error from an event source; fatal to that source.
#[derive(Debug, thiserror::Error)]
#[error("event source error: {0}")]
pub struct SourceError(pub String);

/// The system-call event source port.
pub trait EventSource: Send {
    /// Pulls the next item, blocking up to the source's own deadline.
    ///
    /// # Errors
    ///
    /// A returned [`SourceError`] is fatal: the caller must stop draining
    /// this source.
    fn next(&mut self) -> Result<SourceItem, SourceError>;
}

/// Channel-backed source, for wiring an in-process feeder (and tests).
///
/// The sending half is handed to whatever pumps raw events in; dropping
/// every sender turns into `Eof` on the consumer side.
#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::Receiver<Event>,
    poll: Duration,
}

impl ChannelEventSource {
    /// Creates a source and its feeder handle.
    #[must_use]
    pub fn new(poll: Duration) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx, poll })
    }
}

impl EventSource for ChannelEventSource {
    fn next(&mut self) -> Result<SourceItem, SourceError> {
        match self.rx.recv_timeout(self.poll) {
            Ok(event) => Ok(SourceItem::Event(event)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(SourceItem::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(SourceItem::Eof),
        }
    }
}
