use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::trace;
use slab::Slab;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_HANDLE_EOF, FALSE, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, GetQueuedCompletionStatusEx,
    PostQueuedCompletionStatus, OVERLAPPED_ENTRY,
};

use crate::error::{Error, LibraryError};
use crate::sys::windows::{IoContext, IoListener, IoResult, RequestKind, Transport};

/// Completion key reserved for user-posted completions.
const MESSAGE_KEY: usize = usize::MAX;

fn millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        Some(to) => to
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(to)
            .as_millis()
            .min(u32::MAX as u128 - 1) as u32,
        // INFINITE
        None => u32::MAX,
    }
}

/// A completion-based poller over an I/O completion port.
///
/// Handles are bound once with [`attach`]; interest is implicit in every
/// submitted operation. Up to the configured concurrency, multiple threads
/// may dequeue completions simultaneously with [`poll`] or [`poll_one`].
///
/// [`attach`]: CompletionPort::attach
/// [`poll`]: CompletionPort::poll
pub struct CompletionPort {
    me: Weak<CompletionPort>,
    port: HANDLE,
    transports: Mutex<Slab<Arc<Transport>>>,
    /// Scratch arrays for the batched dequeue, one per concurrent poller.
    buffers: Mutex<Vec<Vec<OVERLAPPED_ENTRY>>>,
    pending: AtomicUsize,
    immediate: AtomicBool,
    immediate_required: AtomicBool,
}

unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

impl CompletionPort {
    /// Creates a port allowing `concurrent_threads` simultaneous pollers.
    pub fn new(concurrent_threads: u32) -> Result<Arc<CompletionPort>, Error> {
        let port = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, concurrent_threads)
        };
        if port.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Arc::new_cyclic(|me| CompletionPort {
            me: me.clone(),
            port,
            transports: Mutex::new(Slab::new()),
            buffers: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            immediate: AtomicBool::new(false),
            immediate_required: AtomicBool::new(false),
        }))
    }

    /// Binds a transport's handle to the port. There is no interest mask;
    /// each submitted operation carries its own.
    pub fn attach(
        &self,
        transport: &Arc<Transport>,
        listener: Arc<dyn IoListener>,
    ) -> Result<(), Error> {
        if transport.is_closed() {
            return Err(Error::Library(LibraryError::TransportClosed));
        }
        if transport.is_attached() {
            return Err(Error::Library(LibraryError::AlreadyAttached));
        }

        if self.immediate.load(Ordering::Acquire) {
            if let Err(err) = transport.enable_immediate_delivery() {
                if self.immediate_required.load(Ordering::Acquire) {
                    return Err(err);
                }
            }
        }

        let key = self.transports.lock().unwrap().insert(transport.clone());
        let rv = unsafe {
            CreateIoCompletionPort(transport.raw_handle() as HANDLE, self.port, key, 0)
        };
        if rv.is_null() {
            self.transports.lock().unwrap().remove(key);
            return Err(Error::last_os_error());
        }

        transport.finish_attach(&self.me, listener, key);
        trace!("attached handle {} with key {}", transport.raw_handle(), key);
        Ok(())
    }

    /// Posts a user completion. The context must be idle or already a
    /// `Message`; message contexts are reference-counted so one context
    /// can sit in the port several times.
    pub fn post(
        &self,
        context: &Arc<IoContext>,
        listener: Arc<dyn IoListener>,
    ) -> Result<(), Error> {
        context.begin(RequestKind::Message)?;
        context.set_message_listener(listener);

        let overlapped = IoContext::into_kernel_ref(context);
        let rv = unsafe { PostQueuedCompletionStatus(self.port, 0, MESSAGE_KEY, overlapped) };
        if rv == FALSE {
            let err = Error::last_os_error();
            unsafe { IoContext::reclaim_kernel_ref(overlapped) };
            context.finish();
            return Err(err);
        }

        self.note_submitted();
        Ok(())
    }

    /// Dequeues and dispatches a batch of completions.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut buffer = {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.pop().unwrap_or_else(|| Vec::with_capacity(64))
        };
        let result = self.poll_batch(&mut buffer, timeout);
        self.buffers.lock().unwrap().push(buffer);
        result
    }

    fn poll_batch(
        &self,
        buffer: &mut Vec<OVERLAPPED_ENTRY>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if buffer.len() == buffer.capacity() {
            buffer.reserve(buffer.capacity().max(64));
        }
        buffer.clear();

        let mut nevents = 0u32;
        let rv = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                buffer.as_mut_ptr(),
                buffer.capacity() as u32,
                &mut nevents,
                millis(timeout),
                FALSE,
            )
        };
        if rv == FALSE {
            let error = unsafe { GetLastError() };
            if error == WAIT_TIMEOUT {
                return Ok(());
            }
            return Err(Error::Io(std::io::Error::from_raw_os_error(error as i32)));
        }

        // SAFETY: the kernel initialized `nevents` entries.
        unsafe { buffer.set_len(nevents as usize) };

        for i in 0..buffer.len() {
            let entry = buffer[i];
            // The inline error marker: the batched path does not carry the
            // per-operation error, so it is queried from the transport.
            self.dispatch(&entry, None);
        }
        Ok(())
    }

    /// Dequeues and dispatches at most one completion.
    pub fn poll_one(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut entry: OVERLAPPED_ENTRY = unsafe { std::mem::zeroed() };
        let rv = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut entry.dwNumberOfBytesTransferred,
                &mut entry.lpCompletionKey,
                &mut entry.lpOverlapped,
                millis(timeout),
            )
        };

        if rv == FALSE && entry.lpOverlapped.is_null() {
            let error = unsafe { GetLastError() };
            if error == WAIT_TIMEOUT {
                return Ok(());
            }
            return Err(Error::Io(std::io::Error::from_raw_os_error(error as i32)));
        }

        // A dequeued-but-failed operation: the error code is available
        // right now, no need to re-query it.
        let inline_error = if rv == FALSE {
            Some(unsafe { GetLastError() })
        } else {
            Some(0)
        };

        self.dispatch(&entry, inline_error);
        Ok(())
    }

    fn dispatch(&self, entry: &OVERLAPPED_ENTRY, inline_error: Option<u32>) {
        // The kernel owed us this reference since submission.
        let context = unsafe { IoContext::from_overlapped(entry.lpOverlapped) };
        self.pending.fetch_sub(1, Ordering::AcqRel);

        let mut result = IoResult {
            completed: true,
            ended: false,
            bytes: entry.dwNumberOfBytesTransferred as usize,
            error: None,
            context: None,
        };

        let kind = context.kind();
        match kind {
            RequestKind::Message => {
                let listener = context.message_listener();
                context.finish();
                result.context = Some(context);
                if let Some(listener) = listener {
                    listener.on_completed(result);
                }
            }
            RequestKind::Read | RequestKind::Write | RequestKind::Other | RequestKind::Cancelled => {
                let transport = self
                    .transports
                    .lock()
                    .unwrap()
                    .get(entry.lpCompletionKey)
                    .cloned();

                let transport = match transport {
                    Some(transport) if !transport.is_closed() && kind != RequestKind::Cancelled => {
                        transport
                    }
                    // Closed or cancelled: swallow the completion, but the
                    // kernel reference still had to be returned.
                    _ => {
                        context.finish();
                        return;
                    }
                };

                let error = match inline_error {
                    Some(error) => error,
                    None => transport.overlapped_error(entry.lpOverlapped),
                };
                if error == ERROR_HANDLE_EOF {
                    result.ended = true;
                } else if error != 0 {
                    // Deliver the failure through the same callback; the
                    // context still comes back.
                    result.bytes = 0;
                    result.error =
                        Some(Error::Io(std::io::Error::from_raw_os_error(error as i32)));
                }

                let listener = transport.listener();
                context.finish();
                result.context = Some(context);

                if let Some(listener) = listener {
                    match kind {
                        RequestKind::Read => listener.on_read(&transport, result),
                        RequestKind::Write => listener.on_write(&transport, result),
                        _ => listener.on_other(&transport, result),
                    }
                }
            }
            RequestKind::None => {
                debug_assert!(false, "completion for an idle context");
            }
        }
    }

    /// Dequeues every pending completion without dispatching, returning
    /// the kernel-owed references. Used at shutdown.
    pub fn wait_and_discard_pending_events(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            let mut entry: OVERLAPPED_ENTRY = unsafe { std::mem::zeroed() };
            let rv = unsafe {
                GetQueuedCompletionStatus(
                    self.port,
                    &mut entry.dwNumberOfBytesTransferred,
                    &mut entry.lpCompletionKey,
                    &mut entry.lpOverlapped,
                    u32::MAX,
                )
            };
            if rv == FALSE && entry.lpOverlapped.is_null() {
                break;
            }

            let context = unsafe { IoContext::from_overlapped(entry.lpOverlapped) };
            context.finish();
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Turns on skip-port-on-synchronous-success for future attachments.
    /// Returns whether the mode is on.
    pub fn enable_immediate_delivery(&self) -> bool {
        self.immediate.store(true, Ordering::Release);
        true
    }

    /// Like [`enable_immediate_delivery`], but attaching a handle that
    /// cannot support the mode becomes an error.
    ///
    /// [`enable_immediate_delivery`]: CompletionPort::enable_immediate_delivery
    pub fn require_immediate_delivery(&self) -> bool {
        self.immediate.store(true, Ordering::Release);
        self.immediate_required.store(true, Ordering::Release);
        true
    }

    /// Unregisters a closed transport's key.
    pub(crate) fn forget(&self, key: usize) {
        let mut transports = self.transports.lock().unwrap();
        if transports.contains(key) {
            transports.remove(key);
        }
    }

    pub(crate) fn note_submitted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}

impl std::fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPort")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}
