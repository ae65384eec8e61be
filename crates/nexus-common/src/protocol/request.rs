//! Request frame decoding and encoding
//!
//! The decoder validates structure (counts, enum values) and produces a
//! typed `Request`; size and address semantics stay with the handlers. The
//! encoder exists for controller-side tooling and tests.

use super::*;
use crate::{Error, Result};

// Body-relative field offsets per union arm. `REQ_BODY` is added on access.
const SCAN_PATTERN: usize = 0;
const SCAN_MASK: usize = 256;
const SCAN_OFFSET: usize = 512;
const SCAN_SECTION: usize = 516;
const SCAN_PATTERN_LEN: usize = 517;

const ASSERT_FILE: usize = 0;
const ASSERT_MSG: usize = 256;
const ASSERT_LINE: usize = 512;
const ASSERT_OFFSET: usize = 516;

const RANGE_START: usize = 0;
const RANGE_END: usize = 4;
const RANGE_PATTERN: usize = 8;
const RANGE_MASK: usize = 264;
const RANGE_OFFSET: usize = 520;
const RANGE_PATTERN_LEN: usize = 524;

const REG_NAME: usize = 0;
const REG_ADDRESS: usize = 64;
const REG_PARAM_COUNT: usize = 68;
const REG_CONVENTION: usize = 69;
const REG_HAS_RETURN: usize = 70;

const CALL_NAME: usize = 0;
const CALL_PARAM_COUNT: usize = 64;
const CALL_PARAMS: usize = 68;

const MEM_ADDRESS: usize = 0;
const MEM_SIZE: usize = 4;
const MEM_PROTECTION: usize = 8;
const MEM_DATA: usize = 12;

const DETOUR_NAME: usize = 0;
const DETOUR_TARGET: usize = 64;
const DETOUR_REPLACEMENT: usize = 68;

const EVENT_NAME: usize = 0;
const EVENT_ADDRESS: usize = 64;
const EVENT_SIZE: usize = 68;
const EVENT_MAX: usize = 72;

const CONTROL_PIPE_NAME: usize = 0;
const CONTROL_WAIT_MS: usize = 256;

const CHAIN_BASE: usize = 0;
const CHAIN_COUNT: usize = 4;
const CHAIN_FINAL_SIZE: usize = 5;
const CHAIN_OFFSETS: usize = 8;

const ARRAY_ADDRESS: usize = 0;
const ARRAY_TYPE: usize = 4;
const ARRAY_COUNT: usize = 8;

const BATCH_COUNT: usize = 0;
const BATCH_SIZES: usize = 1;
const BATCH_ADDRESSES: usize = 36;

const HEARTBEAT_TICK: usize = 0;

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ScanFind {
        pattern: Vec<u8>,
        mask: String,
        offset: i32,
        section: Section,
    },
    ScanFindAssertion {
        file: String,
        message: String,
        line: u32,
        offset: i32,
    },
    ScanFindInRange {
        start: usize,
        end: usize,
        pattern: Vec<u8>,
        mask: String,
        offset: i32,
    },
    ScanToFunctionStart {
        address: usize,
        scan_back: usize,
    },
    ScanFunctionFromNearCall {
        address: usize,
    },
    ReadMemory {
        address: usize,
        size: usize,
    },
    SectionInfo {
        section: Section,
    },
    PointerChain {
        base: usize,
        offsets: Vec<i32>,
        final_size: u8,
    },
    RegisterFunction {
        name: String,
        address: usize,
        param_count: u8,
        convention: CallConvention,
        has_return: bool,
    },
    UnregisterFunction {
        name: String,
    },
    CallFunction {
        name: String,
        params: Vec<Param>,
    },
    ListFunctions,
    Allocate {
        size: usize,
        protection: u32,
    },
    Free {
        address: usize,
    },
    WriteMemory {
        address: usize,
        data: Vec<u8>,
    },
    ProtectMemory {
        address: usize,
        size: usize,
        protection: u32,
    },
    InstallDetour {
        name: String,
        target: usize,
        replacement: usize,
    },
    RemoveDetour {
        name: String,
    },
    EnableDetour {
        name: String,
    },
    DisableDetour {
        name: String,
    },
    PollEvents {
        name: String,
        max: u32,
    },
    RegisterEventBuffer {
        name: String,
        address: usize,
        size: usize,
        capacity: u32,
    },
    UnregisterEventBuffer {
        name: String,
    },
    ArrayRead {
        address: usize,
        element_type: u8,
        count: u32,
    },
    BatchRead {
        entries: Vec<(usize, u8)>,
    },
    ServerStatus,
    ServerStop,
    ServerStart {
        pipe_name: Option<String>,
    },
    ServerRestart {
        pipe_name: Option<String>,
        wait_ms: u32,
    },
    LoaderDetach,
    LoaderStatus,
    Heartbeat {
        client_timestamp: u32,
    },
}

impl Request {
    /// Wire discriminator for this request.
    pub fn kind(&self) -> u32 {
        match self {
            Request::ScanFind { .. } => kind::SCAN_FIND,
            Request::ScanFindAssertion { .. } => kind::SCAN_FIND_ASSERTION,
            Request::ScanFindInRange { .. } => kind::SCAN_FIND_IN_RANGE,
            Request::ScanToFunctionStart { .. } => kind::SCAN_TO_FUNCTION_START,
            Request::ScanFunctionFromNearCall { .. } => kind::SCAN_FUNCTION_FROM_NEAR_CALL,
            Request::ReadMemory { .. } => kind::READ_MEMORY,
            Request::SectionInfo { .. } => kind::GET_SECTION_INFO,
            Request::PointerChain { .. } => kind::READ_POINTER_CHAIN,
            Request::RegisterFunction { .. } => kind::REGISTER_FUNCTION,
            Request::UnregisterFunction { .. } => kind::UNREGISTER_FUNCTION,
            Request::CallFunction { .. } => kind::CALL_FUNCTION,
            Request::ListFunctions => kind::LIST_FUNCTIONS,
            Request::Allocate { .. } => kind::ALLOCATE_MEMORY,
            Request::Free { .. } => kind::FREE_MEMORY,
            Request::WriteMemory { .. } => kind::WRITE_MEMORY,
            Request::ProtectMemory { .. } => kind::PROTECT_MEMORY,
            Request::InstallDetour { .. } => kind::INSTALL_DETOUR,
            Request::RemoveDetour { .. } => kind::REMOVE_DETOUR,
            Request::EnableDetour { .. } => kind::ENABLE_DETOUR,
            Request::DisableDetour { .. } => kind::DISABLE_DETOUR,
            Request::PollEvents { .. } => kind::GET_PENDING_EVENTS,
            Request::RegisterEventBuffer { .. } => kind::REGISTER_EVENT_BUFFER,
            Request::UnregisterEventBuffer { .. } => kind::UNREGISTER_EVENT_BUFFER,
            Request::ArrayRead { .. } => kind::READ_MEMORY_ARRAY,
            Request::BatchRead { .. } => kind::BATCH_READ_MEMORY,
            Request::ServerStatus => kind::SERVER_STATUS,
            Request::ServerStop => kind::SERVER_STOP,
            Request::ServerStart { .. } => kind::SERVER_START,
            Request::ServerRestart { .. } => kind::SERVER_RESTART,
            Request::LoaderDetach => kind::LOADER_DETACH,
            Request::LoaderStatus => kind::LOADER_STATUS,
            Request::Heartbeat { .. } => kind::HEARTBEAT,
        }
    }

    /// Decode one request frame.
    pub fn decode(frame: &[u8]) -> Result<Request> {
        if frame.len() != REQUEST_LEN {
            return Err(Error::Ipc(format!(
                "Bad request frame length: {} (expected {})",
                frame.len(),
                REQUEST_LEN
            )));
        }
        let discriminator = get_u32(frame, 0);
        let body = &frame[REQ_BODY..];

        match discriminator {
            kind::SCAN_FIND => {
                let mask = get_cstr(body, SCAN_MASK, PATTERN_FIELD_LEN);
                let pattern = decode_pattern(body, SCAN_PATTERN, SCAN_PATTERN_LEN, &mask);
                let section = Section::from_wire(get_u8(body, SCAN_SECTION))
                    .ok_or_else(|| Error::InvalidArgument("Invalid section".into()))?;
                Ok(Request::ScanFind {
                    pattern,
                    mask,
                    offset: get_i32(body, SCAN_OFFSET),
                    section,
                })
            }
            kind::SCAN_FIND_ASSERTION => Ok(Request::ScanFindAssertion {
                file: get_cstr(body, ASSERT_FILE, PATTERN_FIELD_LEN),
                message: get_cstr(body, ASSERT_MSG, PATTERN_FIELD_LEN),
                line: get_u32(body, ASSERT_LINE),
                offset: get_i32(body, ASSERT_OFFSET),
            }),
            kind::SCAN_FIND_IN_RANGE => {
                let mask = get_cstr(body, RANGE_MASK, PATTERN_FIELD_LEN);
                let pattern = decode_pattern(body, RANGE_PATTERN, RANGE_PATTERN_LEN, &mask);
                Ok(Request::ScanFindInRange {
                    start: get_u32(body, RANGE_START) as usize,
                    end: get_u32(body, RANGE_END) as usize,
                    pattern,
                    mask,
                    offset: get_i32(body, RANGE_OFFSET),
                })
            }
            kind::SCAN_TO_FUNCTION_START => Ok(Request::ScanToFunctionStart {
                address: get_u32(body, MEM_ADDRESS) as usize,
                scan_back: get_u32(body, MEM_SIZE) as usize,
            }),
            kind::SCAN_FUNCTION_FROM_NEAR_CALL => Ok(Request::ScanFunctionFromNearCall {
                address: get_u32(body, MEM_ADDRESS) as usize,
            }),
            kind::READ_MEMORY => Ok(Request::ReadMemory {
                address: get_u32(body, MEM_ADDRESS) as usize,
                size: get_u32(body, MEM_SIZE) as usize,
            }),
            kind::GET_SECTION_INFO => {
                let section = Section::from_wire(get_u8(body, SCAN_SECTION))
                    .ok_or_else(|| Error::InvalidArgument("Invalid section".into()))?;
                Ok(Request::SectionInfo { section })
            }
            kind::READ_POINTER_CHAIN => {
                let count = get_u8(body, CHAIN_COUNT) as usize;
                if count > MAX_CHAIN_OFFSETS {
                    return Err(Error::InvalidArgument("Too many offsets (max 16)".into()));
                }
                let offsets = (0..count)
                    .map(|i| get_i32(body, CHAIN_OFFSETS + i * 4))
                    .collect();
                Ok(Request::PointerChain {
                    base: get_u32(body, CHAIN_BASE) as usize,
                    offsets,
                    final_size: get_u8(body, CHAIN_FINAL_SIZE),
                })
            }
            kind::REGISTER_FUNCTION => {
                let convention = CallConvention::from_wire(get_u8(body, REG_CONVENTION))
                    .ok_or_else(|| Error::InvalidArgument("Unknown calling convention".into()))?;
                Ok(Request::RegisterFunction {
                    name: get_cstr(body, REG_NAME, NAME_FIELD_LEN),
                    address: get_u32(body, REG_ADDRESS) as usize,
                    param_count: get_u8(body, REG_PARAM_COUNT),
                    convention,
                    has_return: get_u8(body, REG_HAS_RETURN) != 0,
                })
            }
            kind::UNREGISTER_FUNCTION => Ok(Request::UnregisterFunction {
                name: get_cstr(body, CALL_NAME, NAME_FIELD_LEN),
            }),
            kind::CALL_FUNCTION => {
                let count = get_u8(body, CALL_PARAM_COUNT) as usize;
                if count > MAX_CALL_PARAMS {
                    return Err(Error::InvalidArgument(
                        "Too many call parameters (max 10)".into(),
                    ));
                }
                let mut params = Vec::with_capacity(count);
                for i in 0..count {
                    let slab = &body[CALL_PARAMS + i * PARAM_SLAB_LEN..];
                    params.push(decode_param(slab)?);
                }
                Ok(Request::CallFunction {
                    name: get_cstr(body, CALL_NAME, NAME_FIELD_LEN),
                    params,
                })
            }
            kind::LIST_FUNCTIONS => Ok(Request::ListFunctions),
            kind::ALLOCATE_MEMORY => Ok(Request::Allocate {
                size: get_u32(body, MEM_SIZE) as usize,
                protection: get_u32(body, MEM_PROTECTION),
            }),
            kind::FREE_MEMORY => Ok(Request::Free {
                address: get_u32(body, MEM_ADDRESS) as usize,
            }),
            kind::WRITE_MEMORY => {
                let size = get_u32(body, MEM_SIZE) as usize;
                if size > MAX_MEMORY_PAYLOAD {
                    return Err(Error::InvalidArgument(format!(
                        "Write payload exceeds frame capacity ({} bytes)",
                        MAX_MEMORY_PAYLOAD
                    )));
                }
                Ok(Request::WriteMemory {
                    address: get_u32(body, MEM_ADDRESS) as usize,
                    data: body[MEM_DATA..MEM_DATA + size].to_vec(),
                })
            }
            kind::PROTECT_MEMORY => Ok(Request::ProtectMemory {
                address: get_u32(body, MEM_ADDRESS) as usize,
                size: get_u32(body, MEM_SIZE) as usize,
                protection: get_u32(body, MEM_PROTECTION),
            }),
            kind::INSTALL_DETOUR => Ok(Request::InstallDetour {
                name: get_cstr(body, DETOUR_NAME, NAME_FIELD_LEN),
                target: get_u32(body, DETOUR_TARGET) as usize,
                replacement: get_u32(body, DETOUR_REPLACEMENT) as usize,
            }),
            kind::REMOVE_DETOUR => Ok(Request::RemoveDetour {
                name: get_cstr(body, DETOUR_NAME, NAME_FIELD_LEN),
            }),
            kind::ENABLE_DETOUR => Ok(Request::EnableDetour {
                name: get_cstr(body, DETOUR_NAME, NAME_FIELD_LEN),
            }),
            kind::DISABLE_DETOUR => Ok(Request::DisableDetour {
                name: get_cstr(body, DETOUR_NAME, NAME_FIELD_LEN),
            }),
            kind::GET_PENDING_EVENTS => Ok(Request::PollEvents {
                name: get_cstr(body, EVENT_NAME, NAME_FIELD_LEN),
                max: get_u32(body, EVENT_MAX),
            }),
            kind::REGISTER_EVENT_BUFFER => Ok(Request::RegisterEventBuffer {
                name: get_cstr(body, EVENT_NAME, NAME_FIELD_LEN),
                address: get_u32(body, EVENT_ADDRESS) as usize,
                size: get_u32(body, EVENT_SIZE) as usize,
                capacity: get_u32(body, EVENT_MAX),
            }),
            kind::UNREGISTER_EVENT_BUFFER => Ok(Request::UnregisterEventBuffer {
                name: get_cstr(body, EVENT_NAME, NAME_FIELD_LEN),
            }),
            kind::READ_MEMORY_ARRAY => Ok(Request::ArrayRead {
                address: get_u32(body, ARRAY_ADDRESS) as usize,
                element_type: get_u8(body, ARRAY_TYPE),
                count: get_u32(body, ARRAY_COUNT),
            }),
            kind::BATCH_READ_MEMORY => {
                let count = get_u8(body, BATCH_COUNT) as usize;
                if count == 0 || count > MAX_BATCH_ENTRIES {
                    return Err(Error::InvalidArgument(
                        "Invalid batch count (must be 1-32)".into(),
                    ));
                }
                let entries = (0..count)
                    .map(|i| {
                        (
                            get_u32(body, BATCH_ADDRESSES + i * 4) as usize,
                            get_u8(body, BATCH_SIZES + i),
                        )
                    })
                    .collect();
                Ok(Request::BatchRead { entries })
            }
            kind::SERVER_STATUS => Ok(Request::ServerStatus),
            kind::SERVER_STOP => Ok(Request::ServerStop),
            kind::SERVER_START => Ok(Request::ServerStart {
                pipe_name: decode_pipe_name(body),
            }),
            kind::SERVER_RESTART => Ok(Request::ServerRestart {
                pipe_name: decode_pipe_name(body),
                wait_ms: get_u32(body, CONTROL_WAIT_MS),
            }),
            kind::LOADER_DETACH => Ok(Request::LoaderDetach),
            kind::LOADER_STATUS => Ok(Request::LoaderStatus),
            kind::HEARTBEAT => Ok(Request::Heartbeat {
                client_timestamp: get_u32(body, HEARTBEAT_TICK),
            }),
            other => Err(Error::UnknownKind(other)),
        }
    }

    /// Encode this request into a frame (controller side).
    pub fn encode(&self) -> Box<[u8; REQUEST_LEN]> {
        let mut frame = Box::new([0u8; REQUEST_LEN]);
        put_u32(&mut frame[..], 0, self.kind());
        let body = &mut frame[REQ_BODY..];

        match self {
            Request::ScanFind {
                pattern,
                mask,
                offset,
                section,
            } => {
                encode_pattern(body, SCAN_PATTERN, SCAN_PATTERN_LEN, pattern);
                put_cstr(body, SCAN_MASK, PATTERN_FIELD_LEN, mask);
                put_i32(body, SCAN_OFFSET, *offset);
                body[SCAN_SECTION] = section.as_wire();
            }
            Request::ScanFindAssertion {
                file,
                message,
                line,
                offset,
            } => {
                put_cstr(body, ASSERT_FILE, PATTERN_FIELD_LEN, file);
                put_cstr(body, ASSERT_MSG, PATTERN_FIELD_LEN, message);
                put_u32(body, ASSERT_LINE, *line);
                put_i32(body, ASSERT_OFFSET, *offset);
            }
            Request::ScanFindInRange {
                start,
                end,
                pattern,
                mask,
                offset,
            } => {
                put_u32(body, RANGE_START, *start as u32);
                put_u32(body, RANGE_END, *end as u32);
                encode_pattern(body, RANGE_PATTERN, RANGE_PATTERN_LEN, pattern);
                put_cstr(body, RANGE_MASK, PATTERN_FIELD_LEN, mask);
                put_i32(body, RANGE_OFFSET, *offset);
            }
            Request::ScanToFunctionStart { address, scan_back } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
                put_u32(body, MEM_SIZE, *scan_back as u32);
            }
            Request::ScanFunctionFromNearCall { address } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
            }
            Request::ReadMemory { address, size } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
                put_u32(body, MEM_SIZE, *size as u32);
            }
            Request::SectionInfo { section } => {
                body[SCAN_SECTION] = section.as_wire();
            }
            Request::PointerChain {
                base,
                offsets,
                final_size,
            } => {
                put_u32(body, CHAIN_BASE, *base as u32);
                body[CHAIN_COUNT] = offsets.len() as u8;
                body[CHAIN_FINAL_SIZE] = *final_size;
                for (i, off) in offsets.iter().take(MAX_CHAIN_OFFSETS).enumerate() {
                    put_i32(body, CHAIN_OFFSETS + i * 4, *off);
                }
            }
            Request::RegisterFunction {
                name,
                address,
                param_count,
                convention,
                has_return,
            } => {
                put_cstr(body, REG_NAME, NAME_FIELD_LEN, name);
                put_u32(body, REG_ADDRESS, *address as u32);
                body[REG_PARAM_COUNT] = *param_count;
                body[REG_CONVENTION] = convention.as_wire();
                body[REG_HAS_RETURN] = u8::from(*has_return);
            }
            Request::UnregisterFunction { name } => {
                put_cstr(body, CALL_NAME, NAME_FIELD_LEN, name);
            }
            Request::CallFunction { name, params } => {
                put_cstr(body, CALL_NAME, NAME_FIELD_LEN, name);
                body[CALL_PARAM_COUNT] = params.len() as u8;
                for (i, param) in params.iter().take(MAX_CALL_PARAMS).enumerate() {
                    let slab = &mut body[CALL_PARAMS + i * PARAM_SLAB_LEN..];
                    encode_param(param, slab);
                }
            }
            Request::ListFunctions
            | Request::ServerStatus
            | Request::ServerStop
            | Request::LoaderDetach
            | Request::LoaderStatus => {}
            Request::Allocate { size, protection } => {
                put_u32(body, MEM_SIZE, *size as u32);
                put_u32(body, MEM_PROTECTION, *protection);
            }
            Request::Free { address } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
            }
            Request::WriteMemory { address, data } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
                let len = data.len().min(MAX_MEMORY_PAYLOAD);
                put_u32(body, MEM_SIZE, len as u32);
                body[MEM_DATA..MEM_DATA + len].copy_from_slice(&data[..len]);
            }
            Request::ProtectMemory {
                address,
                size,
                protection,
            } => {
                put_u32(body, MEM_ADDRESS, *address as u32);
                put_u32(body, MEM_SIZE, *size as u32);
                put_u32(body, MEM_PROTECTION, *protection);
            }
            Request::InstallDetour {
                name,
                target,
                replacement,
            } => {
                put_cstr(body, DETOUR_NAME, NAME_FIELD_LEN, name);
                put_u32(body, DETOUR_TARGET, *target as u32);
                put_u32(body, DETOUR_REPLACEMENT, *replacement as u32);
            }
            Request::RemoveDetour { name }
            | Request::EnableDetour { name }
            | Request::DisableDetour { name } => {
                put_cstr(body, DETOUR_NAME, NAME_FIELD_LEN, name);
            }
            Request::PollEvents { name, max } => {
                put_cstr(body, EVENT_NAME, NAME_FIELD_LEN, name);
                put_u32(body, EVENT_MAX, *max);
            }
            Request::RegisterEventBuffer {
                name,
                address,
                size,
                capacity,
            } => {
                put_cstr(body, EVENT_NAME, NAME_FIELD_LEN, name);
                put_u32(body, EVENT_ADDRESS, *address as u32);
                put_u32(body, EVENT_SIZE, *size as u32);
                put_u32(body, EVENT_MAX, *capacity);
            }
            Request::UnregisterEventBuffer { name } => {
                put_cstr(body, EVENT_NAME, NAME_FIELD_LEN, name);
            }
            Request::ArrayRead {
                address,
                element_type,
                count,
            } => {
                put_u32(body, ARRAY_ADDRESS, *address as u32);
                body[ARRAY_TYPE] = *element_type;
                put_u32(body, ARRAY_COUNT, *count);
            }
            Request::BatchRead { entries } => {
                body[BATCH_COUNT] = entries.len() as u8;
                for (i, (address, size)) in entries.iter().take(MAX_BATCH_ENTRIES).enumerate() {
                    body[BATCH_SIZES + i] = *size;
                    put_u32(body, BATCH_ADDRESSES + i * 4, *address as u32);
                }
            }
            Request::ServerStart { pipe_name } => {
                if let Some(name) = pipe_name {
                    put_cstr(body, CONTROL_PIPE_NAME, PATTERN_FIELD_LEN, name);
                }
            }
            Request::ServerRestart { pipe_name, wait_ms } => {
                if let Some(name) = pipe_name {
                    put_cstr(body, CONTROL_PIPE_NAME, PATTERN_FIELD_LEN, name);
                }
                put_u32(body, CONTROL_WAIT_MS, *wait_ms);
            }
            Request::Heartbeat { client_timestamp } => {
                put_u32(body, HEARTBEAT_TICK, *client_timestamp);
            }
        }

        frame
    }
}

/// Patterns carry an explicit length byte; a zero or out-of-range length
/// falls back to the mask length, which older controllers rely on.
fn decode_pattern(body: &[u8], pattern_off: usize, len_off: usize, mask: &str) -> Vec<u8> {
    let declared = get_u8(body, len_off) as usize;
    let len = if declared == 0 || declared > PATTERN_FIELD_LEN {
        mask.len().min(PATTERN_FIELD_LEN)
    } else {
        declared
    };
    body[pattern_off..pattern_off + len].to_vec()
}

fn encode_pattern(body: &mut [u8], pattern_off: usize, len_off: usize, pattern: &[u8]) {
    let len = pattern.len().min(PATTERN_FIELD_LEN);
    body[pattern_off..pattern_off + len].copy_from_slice(&pattern[..len]);
    // 256-byte patterns wrap the u8 length field to zero; the mask length
    // takes over on decode.
    body[len_off] = len as u8;
}

fn decode_pipe_name(body: &[u8]) -> Option<String> {
    let name = get_cstr(body, CONTROL_PIPE_NAME, PATTERN_FIELD_LEN);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn decode_param(slab: &[u8]) -> Result<Param> {
    let tag = get_u8(slab, 0);
    let value = &slab[4..];
    match tag {
        param_type::I8 => Ok(Param::I8(value[0] as i8)),
        param_type::I16 => Ok(Param::I16(get_u16(value, 0) as i16)),
        param_type::I32 => Ok(Param::I32(get_u32(value, 0) as i32)),
        param_type::I64 => Ok(Param::I64(get_u64(value, 0) as i64)),
        param_type::F32 => Ok(Param::F32(f32::from_bits(get_u32(value, 0)))),
        param_type::F64 => Ok(Param::F64(f64::from_bits(get_u64(value, 0)))),
        param_type::POINTER => Ok(Param::Pointer(get_u32(value, 0) as usize)),
        param_type::ANSI_STRING => {
            let raw = &value[..PATTERN_FIELD_LEN];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(255);
            let mut bytes = raw[..end].to_vec();
            bytes.push(0);
            Ok(Param::Str(bytes))
        }
        param_type::WIDE_STRING => {
            let mut units = Vec::new();
            for i in 0..127 {
                let unit = get_u16(value, i * 2);
                if unit == 0 {
                    break;
                }
                units.push(unit);
            }
            units.push(0);
            Ok(Param::WStr(units))
        }
        other => Err(Error::InvalidArgument(format!(
            "Unsupported parameter type: {}",
            other
        ))),
    }
}

fn encode_param(param: &Param, slab: &mut [u8]) {
    slab[0] = param.tag();
    let value = &mut slab[4..];
    match param {
        Param::I8(v) => value[0] = *v as u8,
        Param::I16(v) => put_u16(value, 0, *v as u16),
        Param::I32(v) => put_u32(value, 0, *v as u32),
        Param::I64(v) => put_u64(value, 0, *v as u64),
        Param::F32(v) => put_u32(value, 0, v.to_bits()),
        Param::F64(v) => put_u64(value, 0, v.to_bits()),
        Param::Pointer(v) => put_u32(value, 0, *v as u32),
        Param::Str(bytes) => {
            let len = bytes.len().min(PATTERN_FIELD_LEN);
            value[..len].copy_from_slice(&bytes[..len]);
        }
        Param::WStr(units) => {
            for (i, unit) in units.iter().take(128).enumerate() {
                put_u16(value, i * 2, *unit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: Request) -> Request {
        Request::decode(&request.encode()[..]).expect("decode")
    }

    #[test]
    fn test_scan_find_roundtrip() {
        let request = Request::ScanFind {
            pattern: vec![0x8B, 0xF8, 0x6A, 0x03],
            mask: "xxxx".to_string(),
            offset: -0x42,
            section: Section::Text,
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_zero_pattern_length_falls_back_to_mask() {
        let mut frame = Request::ScanFind {
            pattern: vec![0xAA, 0xBB, 0xCC],
            mask: "xx?".to_string(),
            offset: 0,
            section: Section::Text,
        }
        .encode();
        frame[REQ_BODY + SCAN_PATTERN_LEN] = 0;
        match Request::decode(&frame[..]).unwrap() {
            Request::ScanFind { pattern, .. } => assert_eq!(pattern.len(), 3),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_call_function_roundtrip_with_strings() {
        let request = Request::CallFunction {
            name: "SendChat".to_string(),
            params: vec![
                Param::I32(7),
                Param::ansi("hello"),
                Param::wide("wide"),
                Param::F32(2.5),
            ],
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_pointer_chain_rejects_too_many_offsets() {
        let mut frame = Request::PointerChain {
            base: 0x1000,
            offsets: vec![0; 4],
            final_size: 4,
        }
        .encode();
        frame[REQ_BODY + CHAIN_COUNT] = 17;
        let err = Request::decode(&frame[..]).unwrap_err();
        assert!(err.to_string().contains("Too many offsets"));
    }

    #[test]
    fn test_batch_read_roundtrip_and_bounds() {
        let request = Request::BatchRead {
            entries: vec![(0x1000, 1), (0x1002, 2), (0x1004, 4), (0x1008, 8)],
        };
        assert_eq!(roundtrip(request.clone()), request);

        let mut frame = request.encode();
        frame[REQ_BODY + BATCH_COUNT] = 0;
        assert!(Request::decode(&frame[..]).is_err());
        frame[REQ_BODY + BATCH_COUNT] = 33;
        assert!(Request::decode(&frame[..]).is_err());
    }

    #[test]
    fn test_write_memory_rejects_oversize_payload() {
        let mut frame = Request::WriteMemory {
            address: 0x2000,
            data: vec![1, 2, 3],
        }
        .encode();
        put_u32(&mut frame[REQ_BODY..], MEM_SIZE, 4096);
        assert!(Request::decode(&frame[..]).is_err());
    }

    #[test]
    fn test_reserved_batch_request_is_unknown() {
        let mut frame = [0u8; REQUEST_LEN];
        put_u32(&mut frame, 0, kind::BATCH_REQUEST);
        match Request::decode(&frame) {
            Err(Error::UnknownKind(48)) => {}
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_server_restart_carries_wait_and_name() {
        let request = Request::ServerRestart {
            pipe_name: Some("\\\\.\\pipe\\GwNexus_alt".to_string()),
            wait_ms: 250,
        };
        assert_eq!(roundtrip(request.clone()), request);

        // Empty pipe name decodes as None.
        let request = Request::ServerRestart {
            pipe_name: None,
            wait_ms: 0,
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_bad_frame_length_is_transport_error() {
        match Request::decode(&[0u8; 16]) {
            Err(Error::Ipc(_)) => {}
            other => panic!("unexpected decode result: {:?}", other),
        }
    }
}
