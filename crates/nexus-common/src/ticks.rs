//! Millisecond tick source
//!
//! Event timestamps and heartbeat latency use a 32-bit millisecond counter
//! that wraps roughly every 49.7 days; all arithmetic on it must be
//! wrapping. On Windows this is the system tick count so values line up
//! with what controllers observe; elsewhere it counts from process start.

/// Current millisecond tick, truncated to 32 bits.
#[cfg(windows)]
pub fn tick_ms() -> u32 {
    unsafe { windows::Win32::System::SystemInformation::GetTickCount() }
}

#[cfg(not(windows))]
pub fn tick_ms() -> u32 {
    use once_cell::sync::Lazy;
    use std::time::Instant;

    static START: Lazy<Instant> = Lazy::new(Instant::now);
    START.elapsed().as_millis() as u32
}

/// Wraparound-safe latency between a client tick and a server tick.
///
/// A zero client tick means "no timestamp supplied" and yields zero.
pub fn latency_ms(client_tick: u32, server_tick: u32) -> u32 {
    if client_tick == 0 {
        0
    } else {
        server_tick.wrapping_sub(client_tick)
    }
}
