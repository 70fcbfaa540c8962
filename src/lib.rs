//! A portable reactor for non-blocking I/O.
//!
//! evio abstracts the operating systems' event notification models behind
//! one thread-aware API: [`Poller`]s deliver readiness callbacks on Unix
//! (epoll, kqueue, event ports, `poll(2)`, `select(2)`), a
//! `CompletionPort` delivers completion callbacks on Windows, and
//! [`Transport`]s wrap the descriptors or handles being watched. On top of
//! the pollers sit a cross-thread [`TaskQueue`] and an [`EventLoop`] that
//! fuses tasks and I/O into one loop.
//!
//! # Readiness model
//!
//! On Unix the kernel reports that a handle is ready and the program
//! performs the I/O. All backends present edge-triggered semantics on
//! request: readiness is reported once per transition, and a read or write
//! that returns `completed == false` (would-block) re-arms the interest.
//! Backends whose primitive is level-triggered emulate this by stripping
//! interest bits after delivery.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use evio::{EventMode, Interest, Poller, StatusListener, Transport};
//!
//! struct Reader;
//!
//! impl StatusListener for Reader {
//!     fn on_read_ready(&self, transport: &Arc<Transport>) {
//!         let mut buf = [0; 16];
//!         let result = transport.read(&mut buf).unwrap();
//!         assert_eq!(&buf[..result.bytes], b"hello");
//!     }
//! }
//!
//! # fn main() -> Result<(), evio::Error> {
//! let poller = Poller::new()?;
//! let (reader, writer) = Transport::pipe()?;
//!
//! poller.attach(&reader, Arc::new(Reader), Interest::READABLE, EventMode::Level)?;
//! writer.write(b"hello")?;
//! poller.poll(Some(Duration::from_millis(100)))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Completion model
//!
//! On Windows the program submits an operation together with an
//! `IoContext`; the kernel performs the I/O and queues a completion that
//! [`poll`] dequeues and dispatches. When immediate delivery is enabled,
//! operations that finish synchronously skip the port entirely.
//!
//! # Event loops
//!
//! [`EventLoop::run`] prioritizes posted tasks over I/O and can be woken
//! from any thread: through a self-pipe on readiness platforms, through a
//! posted completion on completion platforms. I/O callbacks attached via
//! the loop are buffered by an [`EventQueue`] so they compete with
//! ordinary tasks instead of preempting them.
//!
//! [`poll`]: Poller::poll
//! [`EventQueue`]: crate::EventQueue

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations)]

#[macro_use]
mod macros;

mod error;
mod event_loop;
mod interest;
mod sys;
mod task;
pub mod time;

#[cfg(unix)]
mod event_queue;
#[cfg(unix)]
mod poller;
#[cfg(unix)]
mod transport;

cfg_net! {
    #[cfg(unix)]
    pub mod net;
}

pub use error::{Error, LibraryError};
pub use event_loop::EventLoop;
pub use interest::{EventMode, Interest};
pub use task::{QueueDelegate, Task, TaskQueue};

#[cfg(unix)]
pub use event_queue::EventQueue;
#[cfg(unix)]
pub use poller::{Backend, Poller, StatusListener};
#[cfg(unix)]
pub use transport::{IoResult, Transport, TransportFlags};

#[cfg(windows)]
pub use sys::windows::{
    CompletionPort, IoContext, IoListener, IoResult, RequestKind, Transport,
};
