mod context;
mod iocp;
mod transport;

pub use context::{IoContext, RequestKind};
pub use iocp::CompletionPort;
pub use transport::Transport;

use std::sync::Arc;

/// The outcome of a completion-based operation.
#[derive(Default)]
pub struct IoResult {
    /// True if the operation completed (synchronously or through the
    /// port); false if it is still in flight.
    pub completed: bool,
    /// True if the handle reached end-of-file.
    pub ended: bool,
    /// Bytes transferred.
    pub bytes: usize,
    /// The failure, if the operation completed unsuccessfully.
    pub error: Option<crate::error::Error>,
    /// The context of the finished operation, handed back exactly once per
    /// submission.
    pub context: Option<Arc<IoContext>>,
}

impl std::fmt::Debug for IoResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoResult")
            .field("completed", &self.completed)
            .field("ended", &self.ended)
            .field("bytes", &self.bytes)
            .field("error", &self.error)
            .finish()
    }
}

/// Receives completion notifications.
///
/// Callbacks run on whichever thread dequeued the completion; up to the
/// port's configured concurrency, several may run at once.
pub trait IoListener: Send + Sync {
    /// A read finished.
    fn on_read(&self, _transport: &Arc<Transport>, _result: IoResult) {}

    /// A write finished.
    fn on_write(&self, _transport: &Arc<Transport>, _result: IoResult) {}

    /// A user-posted completion was dequeued.
    fn on_completed(&self, _result: IoResult) {}

    /// An operation of another kind finished.
    fn on_other(&self, _transport: &Arc<Transport>, _result: IoResult) {}
}
