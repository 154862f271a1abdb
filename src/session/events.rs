use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::error::{CoreError, ErrorKind};
use crate::listing::DirectoryListing;
use crate::session::Role;
use crate::transfer::Direction;

/// Typed events emitted by the core. The UI layer consumes these from the
/// channel; the core never touches UI state directly.
#[derive(Debug, Clone)]
pub enum Event {
    Connected { addr: SocketAddr, role: Role },
    Disconnected,
    RemoteListingUpdated(DirectoryListing),
    TransferStarted { name: String, direction: Direction },
    /// Percent complete of the active transfer, monotonically
    /// non-decreasing, 100 exactly once.
    ProgressUpdated { percent: u8 },
    /// Instantaneous throughput over the last sample window.
    SpeedUpdated { bytes_per_sec: f64 },
    Completed { label: String },
    Cancelled { name: String },
    /// The recent-peer list changed; persistence is the UI layer's job.
    RecentPeersUpdated(Vec<String>),
    Error { kind: ErrorKind, message: String },
}

/// Sending side of the event channel, cloned into every background task.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    pub fn emit(&self, event: Event) {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.0.send(event);
    }

    pub fn error(&self, err: &CoreError) {
        self.emit(Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}
