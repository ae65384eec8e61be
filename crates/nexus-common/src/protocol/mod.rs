//! Wire protocol for the GW-Nexus bridge
//!
//! One fixed-size request frame in, one fixed-size response frame out, over
//! a message-mode pipe. Layouts are packed and little-endian with explicit
//! filler bytes; every offset below is part of the ABI and is spelled out
//! here rather than derived from Rust struct layout. Addresses travel as
//! 4-byte values because the bridge targets a 32-bit host.

mod request;
mod response;

pub use request::Request;
pub use response::{Response, ResponseBody, ServerStatus};

/// Total size of a request frame in bytes.
pub const REQUEST_LEN: usize = 2672;
/// Total size of a response frame in bytes.
pub const RESPONSE_LEN: usize = 2860;

/// Offset of the request body (after the u32 discriminator).
pub(crate) const REQ_BODY: usize = 4;

pub const NAME_FIELD_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;
pub const PATTERN_FIELD_LEN: usize = 256;
pub const MAX_CALL_PARAMS: usize = 10;
pub const PARAM_SLAB_LEN: usize = 260;
pub const MAX_MEMORY_PAYLOAD: usize = 1024;
pub const MAX_ARRAY_PAYLOAD: usize = 2048;
pub const MAX_BATCH_ENTRIES: usize = 32;
pub const MAX_CHAIN_OFFSETS: usize = 16;
pub const MAX_LISTED_FUNCTIONS: usize = 20;
pub const MAX_EVENT_PAYLOAD: usize = 256;
pub const EVENT_RECORD_LEN: usize = 12 + MAX_EVENT_PAYLOAD;
pub const EVENT_AREA_LEN: usize = 1024;
pub const MAX_EVENTS_PER_POLL: usize = 10;
pub const ERROR_FIELD_LEN: usize = 256;

/// Stable request discriminator values.
pub mod kind {
    pub const SCAN_FIND: u32 = 1;
    pub const SCAN_FIND_ASSERTION: u32 = 2;
    pub const SCAN_FIND_IN_RANGE: u32 = 3;
    pub const SCAN_TO_FUNCTION_START: u32 = 4;
    pub const SCAN_FUNCTION_FROM_NEAR_CALL: u32 = 5;
    pub const READ_MEMORY: u32 = 6;
    pub const GET_SECTION_INFO: u32 = 7;
    pub const READ_POINTER_CHAIN: u32 = 8;

    pub const REGISTER_FUNCTION: u32 = 10;
    pub const UNREGISTER_FUNCTION: u32 = 11;
    pub const CALL_FUNCTION: u32 = 12;
    pub const LIST_FUNCTIONS: u32 = 13;

    pub const ALLOCATE_MEMORY: u32 = 20;
    pub const FREE_MEMORY: u32 = 21;
    pub const WRITE_MEMORY: u32 = 22;
    pub const PROTECT_MEMORY: u32 = 23;

    pub const INSTALL_DETOUR: u32 = 30;
    pub const REMOVE_DETOUR: u32 = 31;
    pub const ENABLE_DETOUR: u32 = 32;
    pub const DISABLE_DETOUR: u32 = 33;

    pub const GET_PENDING_EVENTS: u32 = 40;
    pub const REGISTER_EVENT_BUFFER: u32 = 41;
    pub const UNREGISTER_EVENT_BUFFER: u32 = 42;

    pub const READ_MEMORY_ARRAY: u32 = 45;

    /// Reserved for multi-operation batches; currently always UnknownKind.
    pub const BATCH_REQUEST: u32 = 48;
    pub const BATCH_READ_MEMORY: u32 = 49;

    pub const SERVER_STATUS: u32 = 50;
    pub const SERVER_STOP: u32 = 51;
    pub const SERVER_START: u32 = 52;
    pub const SERVER_RESTART: u32 = 53;

    pub const LOADER_DETACH: u32 = 60;
    pub const LOADER_STATUS: u32 = 61;

    pub const HEARTBEAT: u32 = 100;
}

/// Human-readable discriminator name for logging.
pub fn kind_name(value: u32) -> &'static str {
    match value {
        kind::SCAN_FIND => "SCAN_FIND",
        kind::SCAN_FIND_ASSERTION => "SCAN_FIND_ASSERTION",
        kind::SCAN_FIND_IN_RANGE => "SCAN_FIND_IN_RANGE",
        kind::SCAN_TO_FUNCTION_START => "SCAN_TO_FUNCTION_START",
        kind::SCAN_FUNCTION_FROM_NEAR_CALL => "SCAN_FUNCTION_FROM_NEAR_CALL",
        kind::READ_MEMORY => "READ_MEMORY",
        kind::GET_SECTION_INFO => "GET_SECTION_INFO",
        kind::READ_POINTER_CHAIN => "READ_POINTER_CHAIN",
        kind::REGISTER_FUNCTION => "REGISTER_FUNCTION",
        kind::UNREGISTER_FUNCTION => "UNREGISTER_FUNCTION",
        kind::CALL_FUNCTION => "CALL_FUNCTION",
        kind::LIST_FUNCTIONS => "LIST_FUNCTIONS",
        kind::ALLOCATE_MEMORY => "ALLOCATE_MEMORY",
        kind::FREE_MEMORY => "FREE_MEMORY",
        kind::WRITE_MEMORY => "WRITE_MEMORY",
        kind::PROTECT_MEMORY => "PROTECT_MEMORY",
        kind::INSTALL_DETOUR => "INSTALL_DETOUR",
        kind::REMOVE_DETOUR => "REMOVE_DETOUR",
        kind::ENABLE_DETOUR => "ENABLE_DETOUR",
        kind::DISABLE_DETOUR => "DISABLE_DETOUR",
        kind::GET_PENDING_EVENTS => "GET_PENDING_EVENTS",
        kind::REGISTER_EVENT_BUFFER => "REGISTER_EVENT_BUFFER",
        kind::UNREGISTER_EVENT_BUFFER => "UNREGISTER_EVENT_BUFFER",
        kind::READ_MEMORY_ARRAY => "READ_MEMORY_ARRAY",
        kind::BATCH_REQUEST => "BATCH_REQUEST",
        kind::BATCH_READ_MEMORY => "BATCH_READ_MEMORY",
        kind::SERVER_STATUS => "SERVER_STATUS",
        kind::SERVER_STOP => "SERVER_STOP",
        kind::SERVER_START => "SERVER_START",
        kind::SERVER_RESTART => "SERVER_RESTART",
        kind::LOADER_DETACH => "LOADER_DETACH",
        kind::LOADER_STATUS => "LOADER_STATUS",
        kind::HEARTBEAT => "HEARTBEAT",
        _ => "UNKNOWN",
    }
}

/// Parameter type tags.
pub mod param_type {
    pub const I8: u8 = 1;
    pub const I16: u8 = 2;
    pub const I32: u8 = 3;
    pub const I64: u8 = 4;
    pub const F32: u8 = 5;
    pub const F64: u8 = 6;
    pub const POINTER: u8 = 7;
    pub const ANSI_STRING: u8 = 8;
    pub const WIDE_STRING: u8 = 9;
}

/// Element size for an array-read element type tag. Pointers use the host
/// pointer width; strings are not valid array elements.
pub fn element_size(tag: u8) -> Option<usize> {
    match tag {
        param_type::I8 => Some(1),
        param_type::I16 => Some(2),
        param_type::I32 | param_type::F32 => Some(4),
        param_type::I64 | param_type::F64 => Some(8),
        param_type::POINTER => Some(std::mem::size_of::<usize>()),
        _ => None,
    }
}

/// Calling conventions understood by the marshaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
}

impl CallConvention {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(CallConvention::Cdecl),
            2 => Some(CallConvention::Stdcall),
            3 => Some(CallConvention::Fastcall),
            4 => Some(CallConvention::Thiscall),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            CallConvention::Cdecl => 1,
            CallConvention::Stdcall => 2,
            CallConvention::Fastcall => 3,
            CallConvention::Thiscall => 4,
        }
    }
}

impl std::fmt::Display for CallConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallConvention::Cdecl => "cdecl",
            CallConvention::Stdcall => "stdcall",
            CallConvention::Fastcall => "fastcall",
            CallConvention::Thiscall => "thiscall",
        };
        f.write_str(name)
    }
}

/// Executable-image section selector for pattern scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Text,
    Rdata,
    Data,
}

impl Section {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Section::Text),
            1 => Some(Section::Rdata),
            2 => Some(Section::Data),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Section::Text => 0,
            Section::Rdata => 1,
            Section::Data => 2,
        }
    }
}

/// A typed call argument.
///
/// String variants keep their NUL terminator so the marshaller can hand the
/// buffer straight to native code.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(usize),
    /// NUL-terminated ANSI bytes, at most 255 + terminator.
    Str(Vec<u8>),
    /// NUL-terminated UTF-16 units, at most 127 + terminator.
    WStr(Vec<u16>),
}

impl Param {
    pub fn tag(&self) -> u8 {
        match self {
            Param::I8(_) => param_type::I8,
            Param::I16(_) => param_type::I16,
            Param::I32(_) => param_type::I32,
            Param::I64(_) => param_type::I64,
            Param::F32(_) => param_type::F32,
            Param::F64(_) => param_type::F64,
            Param::Pointer(_) => param_type::POINTER,
            Param::Str(_) => param_type::ANSI_STRING,
            Param::WStr(_) => param_type::WIDE_STRING,
        }
    }

    /// ANSI string parameter from text (truncated to 255 bytes).
    pub fn ansi(text: &str) -> Self {
        let mut bytes: Vec<u8> = text.bytes().take(255).collect();
        bytes.push(0);
        Param::Str(bytes)
    }

    /// Wide string parameter from text (truncated to 127 units).
    pub fn wide(text: &str) -> Self {
        let mut units: Vec<u16> = text.encode_utf16().take(127).collect();
        units.push(0);
        Param::WStr(units)
    }
}

/// One event as it travels in a poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: u32,
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl EventRecord {
    pub(crate) fn encode_into(&self, slab: &mut [u8]) {
        put_u32(slab, 0, self.id);
        put_u32(slab, 4, self.timestamp);
        let len = self.data.len().min(MAX_EVENT_PAYLOAD);
        put_u32(slab, 8, len as u32);
        slab[12..12 + len].copy_from_slice(&self.data[..len]);
    }

    pub(crate) fn decode_from(slab: &[u8]) -> Self {
        let len = (get_u32(slab, 8) as usize).min(MAX_EVENT_PAYLOAD);
        EventRecord {
            id: get_u32(slab, 0),
            timestamp: get_u32(slab, 4),
            data: slab[12..12 + len].to_vec(),
        }
    }
}

// --- little-endian field accessors -----------------------------------------

pub(crate) fn get_u8(buf: &[u8], off: usize) -> u8 {
    buf[off]
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn get_i32(buf: &[u8], off: usize) -> i32 {
    get_u32(buf, off) as i32
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let lo = get_u32(buf, off) as u64;
    let hi = get_u32(buf, off + 4) as u64;
    lo | (hi << 32)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i32(buf: &mut [u8], off: usize, value: i32) {
    put_u32(buf, off, value as u32);
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a NUL-terminated string out of a fixed-size field.
pub(crate) fn get_cstr(buf: &[u8], off: usize, field_len: usize) -> String {
    let field = &buf[off..off + field_len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field_len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Write a string into a fixed-size field, always NUL-terminated.
pub(crate) fn put_cstr(buf: &mut [u8], off: usize, field_len: usize, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(field_len - 1);
    buf[off..off + len].copy_from_slice(&bytes[..len]);
    buf[off + len] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes_are_abi() {
        // 4-byte discriminator + largest body arm (call-function).
        assert_eq!(REQUEST_LEN, 4 + NAME_FIELD_LEN + 4 + 10 * PARAM_SLAB_LEN);
        // success word + union area + server status + loader status + error.
        assert_eq!(RESPONSE_LEN, 4 + 2064 + 272 + 264 + ERROR_FIELD_LEN);
    }

    #[test]
    fn test_event_record_fits_declared_stride() {
        assert_eq!(EVENT_RECORD_LEN, 268);
        let mut slab = vec![0u8; EVENT_RECORD_LEN];
        let event = EventRecord {
            id: 7,
            timestamp: 1234,
            data: vec![0xAB; 300], // oversize payload is clamped
        };
        event.encode_into(&mut slab);
        let back = EventRecord::decode_from(&slab);
        assert_eq!(back.id, 7);
        assert_eq!(back.data.len(), MAX_EVENT_PAYLOAD);
    }

    #[test]
    fn test_convention_wire_values() {
        assert_eq!(CallConvention::from_wire(1), Some(CallConvention::Cdecl));
        assert_eq!(CallConvention::from_wire(4), Some(CallConvention::Thiscall));
        assert_eq!(CallConvention::from_wire(9), None);
        assert_eq!(CallConvention::Stdcall.as_wire(), 2);
    }

    #[test]
    fn test_param_text_constructors_terminate() {
        match Param::ansi("hello") {
            Param::Str(bytes) => assert_eq!(bytes, b"hello\0".to_vec()),
            other => panic!("unexpected param: {:?}", other),
        }
        match Param::wide("hi") {
            Param::WStr(units) => assert_eq!(units, vec![0x68, 0x69, 0]),
            other => panic!("unexpected param: {:?}", other),
        }
    }

    #[test]
    fn test_element_size_rejects_strings() {
        assert_eq!(element_size(param_type::I32), Some(4));
        assert_eq!(element_size(param_type::F64), Some(8));
        assert_eq!(element_size(param_type::ANSI_STRING), None);
    }

    #[test]
    fn test_cstr_roundtrip_truncates() {
        let mut buf = vec![0u8; 16];
        put_cstr(&mut buf, 0, 8, "longer-than-field");
        let text = get_cstr(&buf, 0, 8);
        assert_eq!(text, "longer-");
    }
}
