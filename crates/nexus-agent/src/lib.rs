//! GW-Nexus agent
//!
//! The injected half of the bridge: a named-pipe endpoint server feeding a
//! dispatcher that resolves controller requests against the host's address
//! space. The injection shim is expected to spawn a loader thread that
//! calls [`run_agent`] and exits the thread with the returned code.
//!
//! Collaborators the agent consumes but does not implement — the pattern
//! scanner, the graphics-frame hook that supplies the host-thread tick, and
//! the identifier provider naming the endpoint — arrive as trait objects in
//! [`Collaborators`].

pub mod bridge;
pub mod endpoint;
pub mod lifecycle;

#[cfg(windows)]
pub mod server;

use bridge::Bridge;
use lifecycle::Lifecycle;
use nexus_common::{error, AgentConfig, Result};
use nexus_core::{DetourBackend, IdentifierProvider, MemoryAccess, PatternScanner};
use std::sync::Arc;
use std::time::Duration;

/// Loader-thread exit codes.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_HOOK_FAILED: i32 = 1;
pub const EXIT_SERVER_FAILED: i32 = 2;

/// Graphics-frame hook collaborator.
///
/// `install` registers a callback the hook must invoke once per host tick
/// on the host thread; the agent wires it to the pending-call drain.
pub trait FrameHook: Send + Sync {
    fn install(&self, tick: Box<dyn Fn() + Send + Sync>) -> Result<()>;
    fn remove(&self);
}

/// External collaborators wired in by the injection shim.
pub struct Collaborators {
    pub scanner: Arc<dyn PatternScanner>,
    pub detours: Arc<dyn DetourBackend>,
    pub identity: Arc<dyn IdentifierProvider>,
    pub frame_hook: Arc<dyn FrameHook>,
}

/// One agent instance: bridge, lifecycle and (on Windows) the pipe server.
pub struct AgentRuntime {
    config: AgentConfig,
    bridge: Arc<Bridge>,
    lifecycle: Arc<Lifecycle>,
    frame_hook: Arc<dyn FrameHook>,
    #[cfg(windows)]
    server: Arc<server::PipeServer>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        memory: Arc<dyn MemoryAccess>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let lifecycle = Arc::new(Lifecycle::new());
        let bridge = Arc::new(Bridge::new(
            memory,
            collaborators.scanner,
            collaborators.detours,
            Arc::clone(&lifecycle),
            Duration::from_millis(config.server.call_timeout_ms),
        ));

        #[cfg(windows)]
        let pipe_server = {
            let pipe_server = Arc::new(server::PipeServer::new(
                Arc::clone(&bridge),
                Arc::clone(&lifecycle),
                collaborators.identity,
            )?);
            bridge.attach_server(Arc::clone(&pipe_server) as Arc<dyn bridge::ServerControl>);
            pipe_server
        };
        #[cfg(not(windows))]
        let _ = collaborators.identity;

        Ok(Self {
            config,
            bridge,
            lifecycle,
            frame_hook: collaborators.frame_hook,
            #[cfg(windows)]
            server: pipe_server,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.bridge)
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Loader-thread body: bring the bridge up, block until a shutdown is
    /// requested (detach request, host teardown), then unwind in order.
    #[cfg(windows)]
    pub fn run(&self) -> i32 {
        use bridge::ServerControl;

        let drain_bridge = Arc::clone(&self.bridge);
        if let Err(e) = self
            .frame_hook
            .install(Box::new(move || drain_bridge.drain_pending_calls()))
        {
            error!(target: "nexus_agent", error = %e, "Frame hook installation failed");
            self.lifecycle.mark_stopped();
            return EXIT_HOOK_FAILED;
        }

        if let Err(e) = self.server.start(self.config.server.pipe_name.clone()) {
            error!(target: "nexus_agent", error = %e, "Endpoint server failed to start");
            self.frame_hook.remove();
            self.lifecycle.mark_stopped();
            return EXIT_SERVER_FAILED;
        }

        self.lifecycle.mark_running();
        nexus_common::info!(target: "nexus_agent", pipe = %self.server.pipe_name(), "Agent running");

        self.lifecycle.wait_for_shutdown();
        nexus_common::info!(target: "nexus_agent", "Shutdown requested, tearing down");

        // Unblock pending calls and release owned resources before the
        // server goes away, so in-flight workers can still deliver their
        // failure responses.
        self.frame_hook.remove();
        self.bridge.shutdown();
        if let Err(e) = self.server.stop() {
            // Already stopped via server control; nothing to unwind.
            nexus_common::debug!(target: "nexus_agent", error = %e, "Server stop during teardown");
        }
        self.server.wait_for_clients(Duration::from_secs(2));

        self.lifecycle.mark_stopped();
        nexus_common::info!(target: "nexus_agent", "Agent stopped");
        EXIT_CLEAN
    }
}

/// Install a panic hook that routes panics into the log file; an injected
/// agent has no stderr anyone will see.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!(target: "nexus_agent::panic", message = %payload, location = %location, "PANIC in agent");
    }));
}

/// Full loader-thread entry point for the 32-bit Windows host: loads the
/// config, sets up logging, builds the runtime over live host memory with
/// the inline detour engine, and runs until shutdown.
#[cfg(all(windows, target_arch = "x86"))]
pub fn run_agent(
    scanner: Arc<dyn PatternScanner>,
    identity: Arc<dyn IdentifierProvider>,
    frame_hook: Arc<dyn FrameHook>,
) -> i32 {
    let config = AgentConfig::load_or_default();
    nexus_common::init_agent_logging(&config.logging);
    install_panic_handler();

    let memory: Arc<dyn MemoryAccess> = Arc::new(nexus_core::host::HostMemory::new());
    let detours: Arc<dyn DetourBackend> = Arc::new(
        nexus_core::detour::inline::InlinePatchBackend::new(Arc::clone(&memory)),
    );

    let runtime = match AgentRuntime::new(
        config,
        memory,
        Collaborators {
            scanner,
            detours,
            identity,
            frame_hook,
        },
    ) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(target: "nexus_agent", error = %e, "Agent initialization failed");
            return EXIT_SERVER_FAILED;
        }
    };

    runtime.run()
}
