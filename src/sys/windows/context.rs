use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::error::{Error, LibraryError};
use crate::sys::windows::IoListener;

/// The state of the operation a context is associated with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    None,
    Read,
    Write,
    Other,
    Message,
    Cancelled,
}

struct ContextState {
    kind: RequestKind,
    /// `Message` contexts may sit in the port several times at once; the
    /// kind only drops back to `None` when the last dequeue happens.
    submissions: usize,
    message_listener: Option<Arc<dyn IoListener>>,
}

/// A per-operation cookie for completion pollers.
///
/// The kernel's `OVERLAPPED` is embedded as the first field, so the context
/// is recovered from a dequeued completion by a plain pointer cast. While
/// an operation is in flight the kernel holds one strong reference, taken
/// at submission and returned exactly once when the completion is dequeued
/// (or discarded, or the submission fails synchronously).
///
/// A context owns its transfer buffer. The buffer is inaccessible while an
/// operation is in flight; once the completion is delivered, [`buffer`]
/// yields the bytes a read produced.
///
/// [`buffer`]: IoContext::buffer
#[repr(C)]
pub struct IoContext {
    overlapped: UnsafeCell<OVERLAPPED>,
    value: AtomicUsize,
    state: Mutex<ContextState>,
    buffer: Mutex<Vec<u8>>,
}

// The OVERLAPPED is only touched by the kernel between submission and
// dequeue, which the request state brackets.
unsafe impl Send for IoContext {}
unsafe impl Sync for IoContext {}

impl IoContext {
    /// Creates a context carrying an arbitrary user value.
    pub fn new(value: usize) -> Arc<IoContext> {
        IoContext::with_capacity(value, 0)
    }

    /// Creates a context whose transfer buffer starts at `capacity` bytes.
    pub fn with_capacity(value: usize, capacity: usize) -> Arc<IoContext> {
        Arc::new(IoContext {
            overlapped: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            value: AtomicUsize::new(value),
            state: Mutex::new(ContextState {
                kind: RequestKind::None,
                submissions: 0,
                message_listener: None,
            }),
            buffer: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn user_value(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Replaces the user value, returning the old one.
    pub fn set_user_value(&self, value: usize) -> usize {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// The operation this context is currently associated with.
    pub fn kind(&self) -> RequestKind {
        self.state.lock().unwrap().kind
    }

    /// Requests cancellation. Returns true if the context held an in-flight
    /// operation; its eventual completion will be swallowed by the poller.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.kind {
            RequestKind::Read | RequestKind::Write | RequestKind::Other | RequestKind::Message => {
                state.kind = RequestKind::Cancelled;
                true
            }
            RequestKind::None | RequestKind::Cancelled => false,
        }
    }

    /// The read buffer, or `None` while an operation is in flight.
    pub fn buffer(&self) -> Option<MutexGuard<'_, Vec<u8>>> {
        if self.kind() != RequestKind::None {
            return None;
        }
        Some(self.buffer.lock().unwrap())
    }

    /// Associates the context with a new operation. Only `None` contexts
    /// may start reads and writes; `Message` contexts may be re-posted.
    pub(crate) fn begin(&self, kind: RequestKind) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let ok = match kind {
            RequestKind::Message => {
                matches!(state.kind, RequestKind::None | RequestKind::Message)
            }
            _ => state.kind == RequestKind::None,
        };
        if !ok {
            return Err(Error::Library(LibraryError::IncompatibleContext));
        }
        state.kind = kind;
        state.submissions += 1;
        Ok(())
    }

    /// Ends one submission, returning the kind it completed as. The state
    /// drops back to `None` once no submissions remain.
    pub(crate) fn finish(&self) -> RequestKind {
        let mut state = self.state.lock().unwrap();
        let kind = state.kind;
        state.submissions = state.submissions.saturating_sub(1);
        if state.submissions == 0 {
            state.kind = RequestKind::None;
            state.message_listener = None;
        }
        kind
    }

    pub(crate) fn set_message_listener(&self, listener: Arc<dyn IoListener>) {
        self.state.lock().unwrap().message_listener = Some(listener);
    }

    pub(crate) fn message_listener(&self) -> Option<Arc<dyn IoListener>> {
        self.state.lock().unwrap().message_listener.clone()
    }

    /// Prepares the buffer for a transfer of `len` bytes and returns its
    /// base pointer. Only valid while the caller holds the submission.
    pub(crate) fn prepare_buffer(&self, len: usize) -> *mut u8 {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.resize(len, 0);
        buffer.as_mut_ptr()
    }

    /// Copies `data` into the buffer and returns its base pointer.
    pub(crate) fn fill_buffer(&self, data: &[u8]) -> *const u8 {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.clear();
        buffer.extend_from_slice(data);
        buffer.as_ptr()
    }

    pub(crate) fn overlapped_ptr(&self) -> *mut OVERLAPPED {
        self.overlapped.get()
    }

    /// Recovers the context address from a kernel-returned `OVERLAPPED`
    /// pointer. The overlapped is the first field of a `#[repr(C)]`
    /// struct, so the addresses coincide.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`overlapped_ptr`] on a context the
    /// kernel still owes a reference for.
    ///
    /// [`overlapped_ptr`]: IoContext::overlapped_ptr
    pub(crate) unsafe fn from_overlapped(ptr: *mut OVERLAPPED) -> Arc<IoContext> {
        Arc::from_raw(ptr as *const IoContext)
    }

    /// Hands the kernel a strong reference for a submitted operation.
    pub(crate) fn into_kernel_ref(this: &Arc<IoContext>) -> *mut OVERLAPPED {
        let raw = Arc::into_raw(this.clone());
        raw as *mut OVERLAPPED
    }

    /// Reclaims the kernel reference after a synchronous failure or skip.
    ///
    /// # Safety
    ///
    /// Must balance exactly one [`into_kernel_ref`].
    ///
    /// [`into_kernel_ref`]: IoContext::into_kernel_ref
    pub(crate) unsafe fn reclaim_kernel_ref(ptr: *mut OVERLAPPED) {
        drop(Arc::from_raw(ptr as *const IoContext));
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("kind", &self.kind())
            .field("value", &self.user_value())
            .finish()
    }
}
