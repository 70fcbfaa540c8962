use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, FALSE, HANDLE,
};
use windows_sys::Win32::Networking::WinSock::{
    closesocket, WSAGetLastError, WSAGetOverlappedResult, WSARecv, WSASend, SOCKET, WSABUF,
    WSAEMSGSIZE, WSA_IO_PENDING,
};
use windows_sys::Win32::Storage::FileSystem::{
    ReadFile, SetFileCompletionNotificationModes, WriteFile, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
};
use windows_sys::Win32::System::IO::{GetOverlappedResult, OVERLAPPED};

use crate::error::{Error, LibraryError};
use crate::sys::windows::iocp::CompletionPort;
use crate::sys::windows::{IoContext, IoListener, IoResult, RequestKind};

const CLOSED: isize = -1;

#[derive(Copy, Clone, PartialEq, Eq)]
enum HandleKind {
    Socket,
    File,
}

/// A byte-oriented endpoint over a Windows `HANDLE` or `SOCKET`.
///
/// Reads and writes are submitted with an [`IoContext`] and complete
/// through the attached [`CompletionPort`], unless immediate delivery is
/// enabled and the operation finishes synchronously.
pub struct Transport {
    handle: AtomicIsize,
    kind: HandleKind,
    auto_close: bool,
    immediate: AtomicBool,
    key: AtomicUsize,
    port: Mutex<Weak<CompletionPort>>,
    listener: Mutex<Option<Arc<dyn IoListener>>>,
}

impl Transport {
    /// Wraps a socket. The socket is closed when the transport is.
    pub fn from_socket(socket: SOCKET) -> Arc<Transport> {
        Arc::new(Transport::from_parts(socket as isize, HandleKind::Socket, true))
    }

    /// Wraps a file or pipe handle. The handle is closed when the
    /// transport is.
    pub fn from_handle(handle: HANDLE) -> Arc<Transport> {
        Arc::new(Transport::from_parts(handle as isize, HandleKind::File, true))
    }

    fn from_parts(handle: isize, kind: HandleKind, auto_close: bool) -> Transport {
        Transport {
            handle: AtomicIsize::new(handle),
            kind,
            auto_close,
            immediate: AtomicBool::new(false),
            key: AtomicUsize::new(usize::MAX),
            port: Mutex::new(Weak::new()),
            listener: Mutex::new(None),
        }
    }

    /// Submits an asynchronous read of up to `len` bytes into the
    /// context's buffer.
    ///
    /// A synchronous completion with immediate delivery enabled fills the
    /// result in place, hands the context back through
    /// [`IoResult::context`], and enqueues nothing. Otherwise a completed
    /// or pending operation reports through the listener when the
    /// completion is dequeued.
    pub fn read(&self, context: &Arc<IoContext>, len: usize) -> Result<IoResult, Error> {
        let port = self.check_operation(len)?;
        context.begin(RequestKind::Read)?;

        let buffer = context.prepare_buffer(len);
        let overlapped = IoContext::into_kernel_ref(context);
        debug_assert_eq!(overlapped, context.overlapped_ptr());

        let (ok, error, transferred) = match self.kind {
            HandleKind::Socket => {
                let mut wsabuf = WSABUF {
                    len: len as u32,
                    buf: buffer,
                };
                let mut received = 0u32;
                let mut flags = 0u32;
                let rv = unsafe {
                    WSARecv(
                        self.raw_handle() as SOCKET,
                        &mut wsabuf,
                        1,
                        &mut received,
                        &mut flags,
                        overlapped,
                        None,
                    )
                };
                if rv == 0 {
                    (true, 0, received)
                } else {
                    (false, unsafe { WSAGetLastError() } as u32, received)
                }
            }
            HandleKind::File => {
                let mut read = 0u32;
                let rv = unsafe {
                    ReadFile(
                        self.raw_handle() as HANDLE,
                        buffer,
                        len as u32,
                        &mut read,
                        overlapped,
                    )
                };
                if rv != FALSE {
                    (true, 0, read)
                } else {
                    (false, unsafe { GetLastError() }, read)
                }
            }
        };

        self.finish_submission(
            port,
            context,
            overlapped,
            ok,
            error,
            transferred,
            RequestKind::Read,
            len,
        )
    }

    /// Submits an asynchronous write of `data`, copied into the context's
    /// buffer first so the caller's slice need not outlive the operation.
    pub fn write(&self, context: &Arc<IoContext>, data: &[u8]) -> Result<IoResult, Error> {
        let port = self.check_operation(data.len())?;
        context.begin(RequestKind::Write)?;

        let buffer = context.fill_buffer(data);
        let overlapped = IoContext::into_kernel_ref(context);

        let (ok, error, transferred) = match self.kind {
            HandleKind::Socket => {
                let mut wsabuf = WSABUF {
                    len: data.len() as u32,
                    buf: buffer as *mut u8,
                };
                let mut sent = 0u32;
                let rv = unsafe {
                    WSASend(
                        self.raw_handle() as SOCKET,
                        &mut wsabuf,
                        1,
                        &mut sent,
                        0,
                        overlapped,
                        None,
                    )
                };
                if rv == 0 {
                    (true, 0, sent)
                } else {
                    (false, unsafe { WSAGetLastError() } as u32, sent)
                }
            }
            HandleKind::File => {
                let mut written = 0u32;
                let rv = unsafe {
                    WriteFile(
                        self.raw_handle() as HANDLE,
                        buffer,
                        data.len() as u32,
                        &mut written,
                        overlapped,
                    )
                };
                if rv != FALSE {
                    (true, 0, written)
                } else {
                    (false, unsafe { GetLastError() }, written)
                }
            }
        };

        self.finish_submission(
            port,
            context,
            overlapped,
            ok,
            error,
            transferred,
            RequestKind::Write,
            data.len(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_submission(
        &self,
        port: Arc<CompletionPort>,
        context: &Arc<IoContext>,
        overlapped: *mut OVERLAPPED,
        ok: bool,
        error: u32,
        transferred: u32,
        kind: RequestKind,
        len: usize,
    ) -> Result<IoResult, Error> {
        let pending = error == ERROR_IO_PENDING || error == WSA_IO_PENDING as u32;
        let truncated = self.kind == HandleKind::Socket && error == WSAEMSGSIZE as u32;

        if !ok && !pending && !truncated && error != ERROR_HANDLE_EOF {
            // Synchronous failure: the kernel never took the operation, so
            // reclaim its reference and release the context.
            unsafe { IoContext::reclaim_kernel_ref(overlapped) };
            context.finish();
            return Err(Error::Io(std::io::Error::from_raw_os_error(error as i32)));
        }

        if pending {
            port.note_submitted();
            return Ok(IoResult::default());
        }

        // Completed synchronously; the out-parameter carries the count.
        let mut result = IoResult {
            completed: true,
            ..IoResult::default()
        };
        if error == ERROR_HANDLE_EOF {
            result.ended = true;
        } else {
            result.bytes = transferred as usize;
            if kind == RequestKind::Read && result.bytes == 0 && len > 0 {
                result.ended = true;
            }
        }

        if self.immediate_delivery() || truncated || error == ERROR_HANDLE_EOF {
            // No completion will be enqueued; give everything back now.
            unsafe { IoContext::reclaim_kernel_ref(overlapped) };
            context.finish();
            result.context = Some(context.clone());
        } else {
            // The completion is still queued; the listener sees it later.
            port.note_submitted();
            result.context = None;
        }
        Ok(result)
    }

    fn check_operation(&self, len: usize) -> Result<Arc<CompletionPort>, Error> {
        if self.is_closed() {
            return Err(Error::Library(LibraryError::TransportClosed));
        }
        if len > i32::MAX as usize {
            return Err(Error::Library(LibraryError::LengthOutOfRange));
        }
        self.port
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(Error::Library(LibraryError::IncompatibleTransport))
    }

    /// Closes the handle; in-flight completions for it are dropped by the
    /// poller. Idempotent.
    pub fn close(&self) {
        let handle = self.handle.swap(CLOSED, Ordering::AcqRel);
        if handle == CLOSED {
            return;
        }

        if let Some(port) = self.port.lock().unwrap().upgrade() {
            port.forget(self.key.load(Ordering::Acquire));
        }
        *self.port.lock().unwrap() = Weak::new();
        *self.listener.lock().unwrap() = None;

        if self.auto_close {
            unsafe {
                match self.kind {
                    HandleKind::Socket => {
                        closesocket(handle as SOCKET);
                    }
                    HandleKind::File => {
                        CloseHandle(handle as HANDLE);
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.load(Ordering::Acquire) == CLOSED
    }

    pub(crate) fn raw_handle(&self) -> isize {
        self.handle.load(Ordering::Acquire)
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn IoListener>> {
        self.listener.lock().unwrap().clone()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    pub(crate) fn finish_attach(
        &self,
        port: &Weak<CompletionPort>,
        listener: Arc<dyn IoListener>,
        key: usize,
    ) {
        *self.port.lock().unwrap() = port.clone();
        *self.listener.lock().unwrap() = Some(listener);
        self.key.store(key, Ordering::Release);
    }

    pub(crate) fn immediate_delivery(&self) -> bool {
        self.immediate.load(Ordering::Acquire)
    }

    /// Asks the kernel to skip the completion port when an operation on
    /// this handle finishes synchronously.
    pub(crate) fn enable_immediate_delivery(&self) -> Result<(), Error> {
        if self.immediate_delivery() {
            return Ok(());
        }
        let rv = unsafe {
            SetFileCompletionNotificationModes(
                self.raw_handle() as HANDLE,
                FILE_SKIP_COMPLETION_PORT_ON_SUCCESS as u8,
            )
        };
        if rv == FALSE {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        self.immediate.store(true, Ordering::Release);
        Ok(())
    }

    /// Queries the error of a finished operation; the batched dequeue path
    /// does not carry it inline.
    pub(crate) fn overlapped_error(&self, overlapped: *mut OVERLAPPED) -> u32 {
        match self.kind {
            HandleKind::Socket => {
                let mut transferred = 0u32;
                let mut flags = 0u32;
                let rv = unsafe {
                    WSAGetOverlappedResult(
                        self.raw_handle() as SOCKET,
                        overlapped,
                        &mut transferred,
                        FALSE,
                        &mut flags,
                    )
                };
                if rv == FALSE {
                    unsafe { WSAGetLastError() as u32 }
                } else {
                    0
                }
            }
            HandleKind::File => {
                let mut transferred = 0u32;
                let rv = unsafe {
                    GetOverlappedResult(
                        self.raw_handle() as HANDLE,
                        overlapped,
                        &mut transferred,
                        FALSE,
                    )
                };
                if rv == FALSE {
                    unsafe { GetLastError() }
                } else {
                    0
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("handle", &self.raw_handle())
            .field("attached", &self.is_attached())
            .finish()
    }
}
