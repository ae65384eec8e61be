//! Named-pipe endpoint server
//!
//! One overlapped pipe instance per pending accept, one OS thread per
//! connected client. The accept loop and every worker I/O wait on the
//! shared stop event, so a stop request unwinds the whole server without
//! touching the workers directly. All I/O is overlapped: blocking-mode
//! pipe calls cannot be cancelled from another thread, and the read/write
//! timeouts need a wait we control.

use crate::bridge::{Bridge, ServerControl};
use crate::endpoint::derive_pipe_name;
use crate::lifecycle::Lifecycle;
use nexus_common::protocol::{ServerStatus, REQUEST_LEN, RESPONSE_LEN};
use nexus_common::{debug, error, info, warn, Error, Result};
use nexus_core::IdentifierProvider;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_IO_PENDING, ERROR_PIPE_CONNECTED,
    ERROR_PIPE_NOT_CONNECTED, HANDLE, WAIT_EVENT, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Security::{
    InitializeSecurityDescriptor, SetSecurityDescriptorDacl, PSECURITY_DESCRIPTOR,
    SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR,
};
use windows::Win32::Storage::FileSystem::{
    FlushFileBuffers, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_DUPLEX,
};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_MESSAGE,
    PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
};
use windows::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION;
use windows::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, INFINITE,
};
use windows::Win32::System::IO::{CancelIo, GetOverlappedResult, OVERLAPPED};

/// Per-I/O timeouts. A client that stays silent past the read timeout or
/// cannot take a response within the write timeout is disconnected.
const READ_TIMEOUT_MS: u32 = 30_000;
const WRITE_TIMEOUT_MS: u32 = 10_000;

/// Pause between stop and start on restart when the request carries none.
const DEFAULT_RESTART_PAUSE_MS: u32 = 100;

/// Owned Win32 manual-reset event, shareable across threads.
struct ManualResetEvent(usize);

// HANDLE is a raw pointer wrapper; the event object itself is thread-safe.
unsafe impl Send for ManualResetEvent {}
unsafe impl Sync for ManualResetEvent {}

impl ManualResetEvent {
    fn new() -> Result<Self> {
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| Error::Ipc(format!("CreateEvent failed: {}", e)))?;
        Ok(Self(handle.0 as usize))
    }

    fn handle(&self) -> HANDLE {
        HANDLE(self.0 as *mut core::ffi::c_void)
    }

    fn set(&self) {
        unsafe {
            let _ = SetEvent(self.handle());
        }
    }

    fn reset(&self) {
        unsafe {
            let _ = ResetEvent(self.handle());
        }
    }
}

impl Drop for ManualResetEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle());
        }
    }
}

/// Scoped pipe-instance handle.
struct PipeHandle(usize);

unsafe impl Send for PipeHandle {}

impl PipeHandle {
    fn handle(&self) -> HANDLE {
        HANDLE(self.0 as *mut core::ffi::c_void)
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = DisconnectNamedPipe(self.handle());
            let _ = CloseHandle(self.handle());
        }
    }
}

struct ServerShared {
    bridge: Arc<Bridge>,
    lifecycle: Arc<Lifecycle>,
    identity: Arc<dyn IdentifierProvider>,
    pipe_name: Mutex<String>,
    running: AtomicBool,
    stop_event: ManualResetEvent,
    client_count: AtomicU32,
    total_connections: AtomicU32,
    started_at: Mutex<Option<Instant>>,
}

pub struct PipeServer {
    shared: Arc<ServerShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PipeServer {
    pub fn new(
        bridge: Arc<Bridge>,
        lifecycle: Arc<Lifecycle>,
        identity: Arc<dyn IdentifierProvider>,
    ) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(ServerShared {
                bridge,
                lifecycle,
                identity,
                pipe_name: Mutex::new(String::new()),
                running: AtomicBool::new(false),
                stop_event: ManualResetEvent::new()?,
                client_count: AtomicU32::new(0),
                total_connections: AtomicU32::new(0),
                started_at: Mutex::new(None),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn pipe_name(&self) -> String {
        self.shared.pipe_name.lock().clone()
    }

    fn start_inner(&self, pipe_name: Option<String>) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgument("Server is already running".into()));
        }

        // The identity may only become available after the host has fully
        // loaded, so the name is derived at each start.
        let name = pipe_name.unwrap_or_else(|| derive_pipe_name(&*self.shared.identity));
        *self.shared.pipe_name.lock() = name.clone();

        self.shared.stop_event.reset();
        self.shared.client_count.store(0, Ordering::SeqCst);
        self.shared.total_connections.store(0, Ordering::SeqCst);
        *self.shared.started_at.lock() = Some(Instant::now());

        info!(target: "nexus_agent::server", pipe = %name, "Starting endpoint server");

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("nexus-accept".into())
            .spawn(move || accept_loop(shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                Error::Internal(format!("Failed to spawn accept thread: {}", e))
            })?;

        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop_inner(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(Error::InvalidArgument("Server is not running".into()));
        }

        info!(target: "nexus_agent::server", "Stopping endpoint server");
        self.shared.stop_event.set();

        // The accept thread owns the listening instance; workers unwind on
        // the stop event during their next I/O wait.
        if let Some(handle) = self.accept_thread.lock().take() {
            if let Err(e) = handle.join() {
                warn!(target: "nexus_agent::server", ?e, "Accept thread panicked");
            }
        }

        *self.shared.started_at.lock() = None;
        Ok(())
    }

    /// Block until every worker has unwound, up to `deadline`.
    pub fn wait_for_clients(&self, deadline: Duration) {
        let started = Instant::now();
        while self.shared.client_count.load(Ordering::SeqCst) > 0 && started.elapsed() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl ServerControl for PipeServer {
    fn status(&self) -> ServerStatus {
        let uptime_ms = self
            .shared
            .started_at
            .lock()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ServerStatus {
            running: self.is_running(),
            client_count: self.shared.client_count.load(Ordering::SeqCst),
            uptime_ms,
            pipe_name: self.pipe_name(),
        }
    }

    fn start(&self, pipe_name: Option<String>) -> Result<()> {
        self.start_inner(pipe_name)
    }

    fn stop(&self) -> Result<()> {
        self.stop_inner()
    }

    fn restart(&self, pipe_name: Option<String>, wait_ms: u32) -> Result<()> {
        if self.is_running() {
            self.stop_inner()?;
        }
        let pause = if wait_ms == 0 {
            DEFAULT_RESTART_PAUSE_MS
        } else {
            wait_ms
        };
        std::thread::sleep(Duration::from_millis(pause as u64));
        self.start_inner(pipe_name)
    }
}

/// NULL-DACL security attributes: any local principal may connect; the
/// OS-level endpoint itself is the only access control.
fn permissive_security(sd: &mut SECURITY_DESCRIPTOR) -> Result<SECURITY_ATTRIBUTES> {
    let psd = PSECURITY_DESCRIPTOR(sd as *mut _ as *mut core::ffi::c_void);
    unsafe {
        InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION)
            .map_err(|e| Error::Ipc(format!("InitializeSecurityDescriptor failed: {}", e)))?;
        SetSecurityDescriptorDacl(psd, true, None, false)
            .map_err(|e| Error::Ipc(format!("SetSecurityDescriptorDacl failed: {}", e)))?;
    }
    Ok(SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: sd as *mut _ as *mut core::ffi::c_void,
        bInheritHandle: false.into(),
    })
}

fn wide_string(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn accept_loop(shared: Arc<ServerShared>) {
    let pipe_name = shared.pipe_name.lock().clone();
    let wide_name = wide_string(&pipe_name);

    let mut sd = SECURITY_DESCRIPTOR::default();
    let sa = match permissive_security(&mut sd) {
        Ok(sa) => sa,
        Err(e) => {
            error!(target: "nexus_agent::server", error = %e, "Security descriptor setup failed");
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let connect_event = match ManualResetEvent::new() {
        Ok(event) => event,
        Err(e) => {
            error!(target: "nexus_agent::server", error = %e, "Connect event creation failed");
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut instance_id: u32 = 0;

    while shared.running.load(Ordering::SeqCst) && !shared.lifecycle.is_shutting_down() {
        instance_id += 1;

        let raw = unsafe {
            CreateNamedPipeW(
                PCWSTR(wide_name.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                RESPONSE_LEN as u32,
                REQUEST_LEN as u32,
                0,
                Some(&sa),
            )
        };
        if raw.is_invalid() {
            error!(
                target: "nexus_agent::server",
                pipe = %pipe_name,
                error = %windows::core::Error::from_win32(),
                "CreateNamedPipe failed"
            );
            shared.running.store(false, Ordering::SeqCst);
            break;
        }
        let instance = PipeHandle(raw.0 as usize);

        connect_event.reset();
        let mut overlapped = OVERLAPPED::default();
        overlapped.hEvent = connect_event.handle();

        let mut connected = false;
        match unsafe { ConnectNamedPipe(instance.handle(), Some(&mut overlapped)) } {
            Ok(()) => connected = true,
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => connected = true,
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                let handles = [connect_event.handle(), shared.stop_event.handle()];
                let wait = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };
                if wait == WAIT_OBJECT_0 {
                    let mut transferred = 0u32;
                    connected = unsafe {
                        GetOverlappedResult(
                            instance.handle(),
                            &overlapped,
                            &mut transferred,
                            false,
                        )
                    }
                    .is_ok();
                } else {
                    // Stop event: cancel the pending accept and bail out.
                    debug!(target: "nexus_agent::server", "Stop signalled during accept");
                    unsafe {
                        let _ = CancelIo(instance.handle());
                    }
                    break;
                }
            }
            Err(e) => {
                warn!(target: "nexus_agent::server", error = %e, "ConnectNamedPipe failed");
            }
        }

        if !connected || !shared.running.load(Ordering::SeqCst) {
            continue; // `instance` drops and closes here
        }

        shared.total_connections.fetch_add(1, Ordering::SeqCst);
        info!(target: "nexus_agent::server", client = instance_id, "Client connected");

        let worker_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name(format!("nexus-client-{}", instance_id))
            .spawn(move || client_worker(worker_shared, instance, instance_id));
        if let Err(e) = spawned {
            error!(target: "nexus_agent::server", error = %e, "Failed to spawn client worker");
        }
    }

    info!(target: "nexus_agent::server", "Accept loop exited");
}

/// Overlapped I/O helper: issue the operation, then wait on its event and
/// the stop event with a timeout.
enum IoOutcome {
    Done(u32),
    Disconnected,
    Stopped,
    TimedOut,
}

fn wait_overlapped(
    pipe: HANDLE,
    overlapped: &OVERLAPPED,
    io_event: HANDLE,
    stop_event: HANDLE,
    timeout_ms: u32,
    issued: std::result::Result<(), windows::core::Error>,
) -> IoOutcome {
    match issued {
        Ok(()) => {}
        Err(e)
            if e.code() == ERROR_BROKEN_PIPE.to_hresult()
                || e.code() == ERROR_PIPE_NOT_CONNECTED.to_hresult() =>
        {
            return IoOutcome::Disconnected;
        }
        Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {}
        Err(e) => {
            debug!(target: "nexus_agent::server", error = %e, "Pipe I/O failed");
            return IoOutcome::Disconnected;
        }
    }

    let handles = [io_event, stop_event];
    let wait = unsafe { WaitForMultipleObjects(&handles, false, timeout_ms) };
    if wait == WAIT_OBJECT_0 {
        let mut transferred = 0u32;
        match unsafe { GetOverlappedResult(pipe, overlapped, &mut transferred, false) } {
            Ok(()) => IoOutcome::Done(transferred),
            Err(e)
                if e.code() == ERROR_BROKEN_PIPE.to_hresult()
                    || e.code() == ERROR_PIPE_NOT_CONNECTED.to_hresult() =>
            {
                IoOutcome::Disconnected
            }
            Err(e) => {
                debug!(target: "nexus_agent::server", error = %e, "GetOverlappedResult failed");
                IoOutcome::Disconnected
            }
        }
    } else if wait == WAIT_EVENT(WAIT_OBJECT_0.0 + 1) {
        unsafe {
            let _ = CancelIo(pipe);
        }
        IoOutcome::Stopped
    } else if wait == WAIT_TIMEOUT {
        unsafe {
            let _ = CancelIo(pipe);
        }
        IoOutcome::TimedOut
    } else {
        unsafe {
            let _ = CancelIo(pipe);
        }
        IoOutcome::Disconnected
    }
}

/// One request frame in, one response frame out, until the client leaves,
/// an I/O deadline lapses or the server stops.
fn client_worker(shared: Arc<ServerShared>, instance: PipeHandle, client_id: u32) {
    shared.client_count.fetch_add(1, Ordering::SeqCst);
    debug!(target: "nexus_agent::server", client = client_id, "Worker started");

    let io_event = match ManualResetEvent::new() {
        Ok(event) => event,
        Err(e) => {
            error!(target: "nexus_agent::server", error = %e, "I/O event creation failed");
            shared.client_count.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    let mut request = vec![0u8; REQUEST_LEN];
    let mut request_count: u32 = 0;

    while shared.running.load(Ordering::SeqCst) && !shared.lifecycle.is_shutting_down() {
        io_event.reset();
        let mut overlapped = OVERLAPPED::default();
        overlapped.hEvent = io_event.handle();

        let issued = unsafe {
            ReadFile(
                instance.handle(),
                Some(request.as_mut_slice()),
                None,
                Some(&mut overlapped),
            )
        };
        let bytes_read = match wait_overlapped(
            instance.handle(),
            &overlapped,
            io_event.handle(),
            shared.stop_event.handle(),
            READ_TIMEOUT_MS,
            issued,
        ) {
            IoOutcome::Done(n) => n,
            IoOutcome::Disconnected => break,
            IoOutcome::Stopped => {
                debug!(target: "nexus_agent::server", client = client_id, "Stop during read");
                break;
            }
            IoOutcome::TimedOut => {
                warn!(target: "nexus_agent::server", client = client_id, "Read timeout, disconnecting");
                break;
            }
        };

        if bytes_read == 0 {
            debug!(target: "nexus_agent::server", client = client_id, "Zero-byte read, client gone");
            break;
        }

        request_count += 1;
        let response = if bytes_read as usize != REQUEST_LEN {
            warn!(
                target: "nexus_agent::server",
                client = client_id,
                bytes = bytes_read,
                "Short request frame"
            );
            nexus_common::protocol::Response::fail_message("Malformed request frame").encode()
        } else {
            // A panicking handler must not take the worker (or host) down.
            let bridge = Arc::clone(&shared.bridge);
            match catch_unwind(AssertUnwindSafe(|| bridge.handle_frame(&request))) {
                Ok(frame) => frame,
                Err(_) => {
                    error!(target: "nexus_agent::server", client = client_id, "Panic during dispatch");
                    nexus_common::protocol::Response::fail_message(
                        "Internal error: panic during dispatch",
                    )
                    .encode()
                }
            }
        };

        io_event.reset();
        let mut overlapped = OVERLAPPED::default();
        overlapped.hEvent = io_event.handle();

        let issued = unsafe {
            WriteFile(
                instance.handle(),
                Some(&response[..]),
                None,
                Some(&mut overlapped),
            )
        };
        match wait_overlapped(
            instance.handle(),
            &overlapped,
            io_event.handle(),
            shared.stop_event.handle(),
            WRITE_TIMEOUT_MS,
            issued,
        ) {
            IoOutcome::Done(_) => {}
            IoOutcome::Disconnected => break,
            IoOutcome::Stopped => break,
            IoOutcome::TimedOut => {
                warn!(target: "nexus_agent::server", client = client_id, "Write timeout, disconnecting");
                break;
            }
        }

        unsafe {
            let _ = FlushFileBuffers(instance.handle());
        }
    }

    shared.client_count.fetch_sub(1, Ordering::SeqCst);
    info!(
        target: "nexus_agent::server",
        client = client_id,
        requests = request_count,
        "Client disconnected"
    );
    // `instance` drops here: disconnect + close.
}
