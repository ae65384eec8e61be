//! Request dispatcher
//!
//! One `Bridge` per process owns every registry and the pending-call queue.
//! Workers feed it raw frames; handlers run inline on the worker thread
//! except native calls, which detour through the host-thread queue. The
//! frame-hook collaborator calls [`Bridge::drain_pending_calls`] once per
//! host tick.

use crate::lifecycle::Lifecycle;
use nexus_common::protocol::{
    kind_name, Request, Response, ResponseBody, ServerStatus, EVENT_AREA_LEN, EVENT_RECORD_LEN,
    MAX_EVENTS_PER_POLL, MAX_LISTED_FUNCTIONS, MAX_MEMORY_PAYLOAD, RESPONSE_LEN,
};
use nexus_common::ticks::{latency_ms, tick_ms};
use nexus_common::{build_info, debug, info, warn, Error, Result, BRIDGE_VERSION};
use nexus_core::{
    marshal, memory, AllocationRegistry, CallQueue, DetourBackend, DetourRegistry, EventRings,
    FunctionRecord, FunctionRegistry, MemoryAccess, PatternScanner,
};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Control surface of the endpoint server, as seen by the dispatcher.
///
/// Implemented by the pipe server; a stub in tests. Kept as a seam because
/// server-control requests arrive through a worker owned by the very server
/// they manipulate.
pub trait ServerControl: Send + Sync {
    fn status(&self) -> ServerStatus;
    fn start(&self, pipe_name: Option<String>) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn restart(&self, pipe_name: Option<String>, wait_ms: u32) -> Result<()>;
}

pub struct Bridge {
    memory: Arc<dyn MemoryAccess>,
    scanner: Arc<dyn PatternScanner>,
    functions: Arc<FunctionRegistry>,
    allocations: AllocationRegistry,
    detours: DetourRegistry,
    events: EventRings,
    calls: CallQueue,
    lifecycle: Arc<Lifecycle>,
    server: OnceCell<Arc<dyn ServerControl>>,
}

impl Bridge {
    pub fn new(
        memory: Arc<dyn MemoryAccess>,
        scanner: Arc<dyn PatternScanner>,
        detour_backend: Arc<dyn DetourBackend>,
        lifecycle: Arc<Lifecycle>,
        call_timeout: Duration,
    ) -> Self {
        info!(target: "nexus_agent::bridge", timeout_ms = call_timeout.as_millis() as u64, "Bridge initialized");
        Self {
            memory,
            scanner,
            functions: Arc::new(FunctionRegistry::new()),
            allocations: AllocationRegistry::new(),
            detours: DetourRegistry::new(detour_backend),
            events: EventRings::new(),
            calls: CallQueue::new(call_timeout),
            lifecycle,
            server: OnceCell::new(),
        }
    }

    /// Wire up the server control surface once it exists. The server owns
    /// the workers that feed this bridge, so it is attached after
    /// construction.
    pub fn attach_server(&self, server: Arc<dyn ServerControl>) {
        let _ = self.server.set(server);
    }

    fn server(&self) -> Result<&Arc<dyn ServerControl>> {
        self.server
            .get()
            .ok_or_else(|| Error::Internal("Server control unavailable".into()))
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Decode, dispatch, encode. Never fails: malformed frames become
    /// failure responses.
    pub fn handle_frame(&self, frame: &[u8]) -> Box<[u8; RESPONSE_LEN]> {
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: "nexus_agent::bridge", error = %e, "Rejected undecodable frame");
                return Response::fail(&e).encode();
            }
        };

        let started = Instant::now();
        let response = self.handle_request(&request);
        debug!(
            target: "nexus_agent::bridge",
            kind = kind_name(request.kind()),
            success = response.success,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Handled request"
        );
        if !response.success {
            debug!(target: "nexus_agent::bridge", kind = kind_name(request.kind()), error = %response.error, "Request failed");
        }

        response.encode()
    }

    /// Route one request to its handler, gated on the lifecycle atom.
    pub fn handle_request(&self, request: &Request) -> Response {
        if self.lifecycle.is_shutting_down() {
            return Response::fail(&Error::ShuttingDown);
        }

        match request {
            // Batch reads report per-entry outcomes even when every entry
            // failed, so they build their response directly.
            Request::BatchRead { entries } => self.handle_batch_read(entries),
            _ => match self.dispatch(request) {
                Ok(body) => Response::ok(body),
                Err(e) => Response::fail(&e),
            },
        }
    }

    fn dispatch(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::ScanFind { .. }
            | Request::ScanFindAssertion { .. }
            | Request::ScanFindInRange { .. }
            | Request::ScanToFunctionStart { .. }
            | Request::ScanFunctionFromNearCall { .. }
            | Request::SectionInfo { .. }
            | Request::ReadMemory { .. }
            | Request::PointerChain { .. } => self.handle_memory_query(request),

            Request::RegisterFunction { .. }
            | Request::UnregisterFunction { .. }
            | Request::CallFunction { .. }
            | Request::ListFunctions => self.handle_function(request),

            Request::Allocate { .. }
            | Request::Free { .. }
            | Request::WriteMemory { .. }
            | Request::ProtectMemory { .. } => self.handle_allocation(request),

            Request::InstallDetour { .. }
            | Request::RemoveDetour { .. }
            | Request::EnableDetour { .. }
            | Request::DisableDetour { .. } => self.handle_detour(request),

            Request::PollEvents { .. }
            | Request::RegisterEventBuffer { .. }
            | Request::UnregisterEventBuffer { .. } => self.handle_event(request),

            Request::ArrayRead {
                address,
                element_type,
                count,
            } => {
                let result = memory::read_array(&*self.memory, *address, *element_type, *count)?;
                Ok(ResponseBody::Array {
                    element_type: result.element_type,
                    element_size: result.element_size,
                    data: result.data,
                })
            }
            Request::BatchRead { .. } => unreachable!("handled in handle_request"),

            Request::ServerStatus
            | Request::ServerStop
            | Request::ServerStart { .. }
            | Request::ServerRestart { .. } => self.handle_server_control(request),

            Request::LoaderDetach | Request::LoaderStatus => self.handle_loader(request),

            Request::Heartbeat { client_timestamp } => {
                let server_timestamp = tick_ms();
                Ok(ResponseBody::Heartbeat {
                    client_timestamp: *client_timestamp,
                    server_timestamp,
                    latency_ms: latency_ms(*client_timestamp, server_timestamp),
                })
            }
        }
    }

    // --- scans, reads and pointer chains -----------------------------------

    fn handle_memory_query(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::ScanFind {
                pattern,
                mask,
                offset,
                section,
            } => self
                .scanner
                .find(pattern, mask, *offset, *section)
                .map(|address| ResponseBody::Scan { address })
                .ok_or_else(|| Error::NotFound("Pattern".into())),

            Request::ScanFindAssertion {
                file,
                message,
                line,
                offset,
            } => self
                .scanner
                .find_assertion(file, message, *line, *offset)
                .map(|address| ResponseBody::Scan { address })
                .ok_or_else(|| Error::NotFound("Assertion".into())),

            Request::ScanFindInRange {
                start,
                end,
                pattern,
                mask,
                offset,
            } => self
                .scanner
                .find_in_range(pattern, mask, *offset, *start, *end)
                .map(|address| ResponseBody::Scan { address })
                .ok_or_else(|| Error::NotFound("Pattern".into())),

            Request::ScanToFunctionStart { address, scan_back } => {
                let scan_back = if *scan_back == 0 { 0xFF } else { *scan_back };
                self.scanner
                    .to_function_start(*address, scan_back)
                    .map(|address| ResponseBody::Scan { address })
                    .ok_or_else(|| Error::NotFound("Function start".into()))
            }

            Request::ScanFunctionFromNearCall { address } => self
                .scanner
                .function_from_near_call(*address)
                .map(|address| ResponseBody::Scan { address })
                .ok_or_else(|| Error::NotFound("Function address".into())),

            Request::SectionInfo { section } => match self.scanner.section_range(*section) {
                Some((start, end)) if start != 0 && end != 0 => {
                    Ok(ResponseBody::SectionInfo { start, end })
                }
                _ => Err(Error::NotFound("Section".into())),
            },

            Request::ReadMemory { address, size } => {
                if *address == 0 || *size == 0 || *size > MAX_MEMORY_PAYLOAD {
                    return Err(Error::InvalidArgument("Invalid read parameters".into()));
                }
                let data = self.memory.read(*address, *size)?;
                Ok(ResponseBody::Memory {
                    address: *address,
                    data,
                })
            }

            Request::PointerChain {
                base,
                offsets,
                final_size,
            } => {
                let result =
                    memory::follow_pointer_chain(&*self.memory, *base, offsets, *final_size)?;
                Ok(ResponseBody::PointerChain {
                    final_address: result.final_address,
                    value: result.value,
                })
            }

            _ => Err(Error::Internal("Misrouted memory query".into())),
        }
    }

    // --- function registry and native calls --------------------------------

    fn handle_function(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::RegisterFunction {
                name,
                address,
                param_count,
                convention,
                has_return,
            } => {
                self.functions.register(
                    &*self.memory,
                    FunctionRecord {
                        name: name.clone(),
                        address: *address,
                        param_count: *param_count,
                        convention: *convention,
                        has_return: *has_return,
                    },
                )?;
                Ok(ResponseBody::None)
            }

            Request::UnregisterFunction { name } => {
                self.functions.unregister(name)?;
                Ok(ResponseBody::None)
            }

            Request::CallFunction { name, params } => {
                debug!(target: "nexus_agent::bridge", function = %name, params = params.len(), "Queueing call for host thread");

                // Resolution happens on the host thread at drain time, so a
                // function unregistered while queued fails cleanly.
                let functions = Arc::clone(&self.functions);
                let memory = Arc::clone(&self.memory);
                let name = name.clone();
                let params = params.clone();

                let outcome = self.calls.call(Box::new(move || {
                    let record = functions
                        .get(&name)
                        .ok_or_else(|| Error::NotFound("Function".into()))?;
                    marshal::invoke(&*memory, &record, &params)
                }))?;

                Ok(ResponseBody::Call {
                    has_return: outcome.has_return,
                    value: outcome.value as u32,
                })
            }

            Request::ListFunctions => {
                let mut names = self.functions.list();
                names.sort();
                names.truncate(MAX_LISTED_FUNCTIONS);
                Ok(ResponseBody::FunctionList { names })
            }

            _ => Err(Error::Internal("Misrouted function request".into())),
        }
    }

    // --- allocations, writes and protection --------------------------------

    fn handle_allocation(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::Allocate { size, protection } => {
                let address = self.allocations.allocate(&*self.memory, *size, *protection)?;
                Ok(ResponseBody::Allocated {
                    address,
                    size: *size,
                })
            }

            Request::Free { address } => {
                self.allocations.free(&*self.memory, *address)?;
                Ok(ResponseBody::None)
            }

            Request::WriteMemory { address, data } => {
                self.memory.write(*address, data)?;
                Ok(ResponseBody::None)
            }

            Request::ProtectMemory {
                address,
                size,
                protection,
            } => {
                if *address == 0 || *size == 0 {
                    return Err(Error::InvalidArgument("Invalid protect parameters".into()));
                }
                self.memory.probe_committed(*address)?;
                self.memory.protect(*address, *size, *protection)?;
                Ok(ResponseBody::None)
            }

            _ => Err(Error::Internal("Misrouted allocation request".into())),
        }
    }

    // --- detours ------------------------------------------------------------

    fn handle_detour(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::InstallDetour {
                name,
                target,
                replacement,
            } => self
                .detours
                .install(&*self.memory, name, *target, *replacement),
            Request::RemoveDetour { name } => self.detours.remove(name),
            Request::EnableDetour { name } => self.detours.enable(name),
            Request::DisableDetour { name } => self.detours.disable(name),
            _ => Err(Error::Internal("Misrouted detour request".into())),
        }
        .map(|_| ResponseBody::None)
    }

    // --- event rings ---------------------------------------------------------

    fn handle_event(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::PollEvents { name, max } => {
                // The response area fits fewer records than the nominal
                // per-poll maximum; the remainder stays queued for the next
                // poll.
                let fit = EVENT_AREA_LEN / EVENT_RECORD_LEN;
                let max = if *max == 0 {
                    fit
                } else {
                    (*max as usize).min(MAX_EVENTS_PER_POLL).min(fit)
                };
                let events = self.events.poll(name, max)?;
                Ok(ResponseBody::Events { events })
            }

            Request::RegisterEventBuffer {
                name,
                address,
                size,
                capacity,
            } => {
                self.events
                    .register(&*self.memory, name, *address, *size, *capacity)?;
                Ok(ResponseBody::None)
            }

            Request::UnregisterEventBuffer { name } => {
                self.events.unregister(name)?;
                Ok(ResponseBody::None)
            }

            _ => Err(Error::Internal("Misrouted event request".into())),
        }
    }

    // --- bulk reads ----------------------------------------------------------

    fn handle_batch_read(&self, entries: &[(usize, u8)]) -> Response {
        let outcome = memory::batch_read(&*self.memory, entries);
        let any_succeeded = outcome.any_succeeded();
        let body = ResponseBody::Batch {
            count: entries.len() as u8,
            success_mask: outcome.success_mask,
            values: outcome.values,
        };

        if any_succeeded {
            Response::ok(body)
        } else {
            Response {
                success: false,
                body,
                error: "All batch reads failed".to_string(),
            }
        }
    }

    // --- server and loader control -------------------------------------------

    fn handle_server_control(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::ServerStatus => {
                let status = self.server()?.status();
                info!(
                    target: "nexus_agent::bridge",
                    running = status.running,
                    clients = status.client_count,
                    uptime_ms = status.uptime_ms,
                    "Server status requested"
                );
                Ok(ResponseBody::ServerStatus(status))
            }
            Request::ServerStop => {
                self.server()?.stop()?;
                Ok(ResponseBody::None)
            }
            Request::ServerStart { pipe_name } => {
                self.server()?.start(pipe_name.clone())?;
                Ok(ResponseBody::None)
            }
            Request::ServerRestart { pipe_name, wait_ms } => {
                self.server()?.restart(pipe_name.clone(), *wait_ms)?;
                Ok(ResponseBody::None)
            }
            _ => Err(Error::Internal("Misrouted server-control request".into())),
        }
    }

    fn handle_loader(&self, request: &Request) -> Result<ResponseBody> {
        match request {
            Request::LoaderStatus => Ok(ResponseBody::LoaderStatus {
                state: self.lifecycle.state() as i32,
                version: BRIDGE_VERSION,
                build_info: build_info(),
            }),
            Request::LoaderDetach => {
                info!(target: "nexus_agent::bridge", "Loader detach requested");
                self.lifecycle.request_shutdown();
                Ok(ResponseBody::None)
            }
            _ => Err(Error::Internal("Misrouted loader request".into())),
        }
    }

    // --- host-side surface ----------------------------------------------------

    /// Drain queued calls. Must run on the host thread; wired to the
    /// frame-hook collaborator's per-tick callback.
    pub fn drain_pending_calls(&self) {
        self.calls.drain();
    }

    /// Enqueue an event from host-side code into a named ring.
    pub fn push_event(&self, ring: &str, id: u32, data: &[u8]) -> bool {
        self.events.push(ring, id, data)
    }

    /// Number of calls waiting for the next drain tick.
    pub fn pending_call_count(&self) -> usize {
        self.calls.len()
    }

    /// Tear down in dependency order: unblock waiters, then release what
    /// the bridge owns, then clear the registries.
    pub fn shutdown(&self) {
        info!(target: "nexus_agent::bridge", "Bridge shutting down");
        self.calls.fail_all("Server is shutting down");
        self.allocations.release_all(&*self.memory);
        self.detours.remove_all();
        self.functions.clear();
        self.events.clear();
    }
}
