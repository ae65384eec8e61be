//! Response frame encoding and decoding
//!
//! Handlers build a `Response` and the worker serializes it; the decoder is
//! the controller-side view used by tooling and tests. Server status and
//! loader status live at fixed offsets outside the result union, so a status
//! response can coexist with the error field exactly as the ABI lays it out.

use super::*;
use crate::error::Error;

// Union-area offsets, relative to RESP_UNION.
const RESP_UNION: usize = 4;
const UNION_LEN: usize = 2064;

const SCAN_ADDRESS: usize = 0;

const CALL_HAS_RETURN: usize = 0;
const CALL_VALUE: usize = 4;

const MEMORY_ADDRESS: usize = 0;
const MEMORY_SIZE: usize = 4;
const MEMORY_DATA: usize = 8;

const LIST_COUNT: usize = 0;
const LIST_NAMES: usize = 4;

const SECTION_START: usize = 0;
const SECTION_END: usize = 4;

const EVENTS_COUNT: usize = 0;
const EVENTS_DATA: usize = 4;

const CHAIN_FINAL_ADDRESS: usize = 0;
const CHAIN_VALUE: usize = 4;

const ARRAY_TYPE: usize = 0;
const ARRAY_COUNT: usize = 4;
const ARRAY_ELEMENT_SIZE: usize = 8;
const ARRAY_TOTAL_SIZE: usize = 12;
const ARRAY_DATA: usize = 16;

const BATCH_COUNT: usize = 0;
const BATCH_MASK: usize = 1;
const BATCH_VALUES: usize = 8;

const HB_CLIENT: usize = 0;
const HB_SERVER: usize = 4;
const HB_LATENCY: usize = 8;

// Fixed-offset areas outside the union.
const RESP_SERVER_STATUS: usize = RESP_UNION + UNION_LEN;
const SRV_STATUS: usize = 0;
const SRV_CLIENTS: usize = 4;
const SRV_UPTIME: usize = 8;
const SRV_PIPE_NAME: usize = 16;

const RESP_LOADER_STATUS: usize = RESP_SERVER_STATUS + 272;
const LDR_STATE: usize = 0;
const LDR_VERSION: usize = 4;
const LDR_BUILD_INFO: usize = 8;

const RESP_ERROR: usize = RESP_LOADER_STATUS + 264;

/// Server statistics as reported by the status operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerStatus {
    pub running: bool,
    pub client_count: u32,
    pub uptime_ms: u64,
    pub pipe_name: String,
}

/// The payload half of a response.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseBody {
    #[default]
    None,
    Scan {
        address: usize,
    },
    Call {
        has_return: bool,
        value: u32,
    },
    Memory {
        address: usize,
        data: Vec<u8>,
    },
    /// Allocation result: the memory-result arm with a size but no payload.
    Allocated {
        address: usize,
        size: usize,
    },
    FunctionList {
        names: Vec<String>,
    },
    SectionInfo {
        start: usize,
        end: usize,
    },
    Events {
        events: Vec<EventRecord>,
    },
    PointerChain {
        final_address: usize,
        value: u64,
    },
    Array {
        element_type: u8,
        element_size: u32,
        data: Vec<u8>,
    },
    Batch {
        count: u8,
        success_mask: u32,
        values: Vec<u64>,
    },
    Heartbeat {
        client_timestamp: u32,
        server_timestamp: u32,
        latency_ms: u32,
    },
    ServerStatus(ServerStatus),
    LoaderStatus {
        state: i32,
        version: u32,
        build_info: String,
    },
}

/// One response frame's worth of data.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub success: bool,
    pub body: ResponseBody,
    pub error: String,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Response {
            success: true,
            body,
            error: String::new(),
        }
    }

    pub fn fail(err: &Error) -> Self {
        Response {
            success: false,
            body: ResponseBody::None,
            error: err.to_string(),
        }
    }

    pub fn fail_message(message: impl Into<String>) -> Self {
        Response {
            success: false,
            body: ResponseBody::None,
            error: message.into(),
        }
    }

    /// Encode into a response frame.
    pub fn encode(&self) -> Box<[u8; RESPONSE_LEN]> {
        let mut frame = Box::new([0u8; RESPONSE_LEN]);
        frame[0] = u8::from(self.success);

        match &self.body {
            ResponseBody::None => {}
            ResponseBody::Scan { address } => {
                let u = &mut frame[RESP_UNION..];
                put_u32(u, SCAN_ADDRESS, *address as u32);
            }
            ResponseBody::Call { has_return, value } => {
                let u = &mut frame[RESP_UNION..];
                u[CALL_HAS_RETURN] = u8::from(*has_return);
                put_u32(u, CALL_VALUE, *value);
            }
            ResponseBody::Memory { address, data } => {
                let u = &mut frame[RESP_UNION..];
                let len = data.len().min(MAX_MEMORY_PAYLOAD);
                put_u32(u, MEMORY_ADDRESS, *address as u32);
                put_u32(u, MEMORY_SIZE, len as u32);
                u[MEMORY_DATA..MEMORY_DATA + len].copy_from_slice(&data[..len]);
            }
            ResponseBody::Allocated { address, size } => {
                let u = &mut frame[RESP_UNION..];
                put_u32(u, MEMORY_ADDRESS, *address as u32);
                put_u32(u, MEMORY_SIZE, *size as u32);
            }
            ResponseBody::FunctionList { names } => {
                let u = &mut frame[RESP_UNION..];
                let count = names.len().min(MAX_LISTED_FUNCTIONS);
                put_u32(u, LIST_COUNT, count as u32);
                for (i, name) in names.iter().take(count).enumerate() {
                    put_cstr(u, LIST_NAMES + i * NAME_FIELD_LEN, NAME_FIELD_LEN, name);
                }
            }
            ResponseBody::SectionInfo { start, end } => {
                let u = &mut frame[RESP_UNION..];
                put_u32(u, SECTION_START, *start as u32);
                put_u32(u, SECTION_END, *end as u32);
            }
            ResponseBody::Events { events } => {
                let u = &mut frame[RESP_UNION..];
                let fit = EVENT_AREA_LEN / EVENT_RECORD_LEN;
                let count = events.len().min(fit);
                put_u32(u, EVENTS_COUNT, count as u32);
                for (i, event) in events.iter().take(count).enumerate() {
                    let slab = &mut u[EVENTS_DATA + i * EVENT_RECORD_LEN..];
                    event.encode_into(slab);
                }
            }
            ResponseBody::PointerChain {
                final_address,
                value,
            } => {
                let u = &mut frame[RESP_UNION..];
                put_u32(u, CHAIN_FINAL_ADDRESS, *final_address as u32);
                put_u64(u, CHAIN_VALUE, *value);
            }
            ResponseBody::Array {
                element_type,
                element_size,
                data,
            } => {
                let u = &mut frame[RESP_UNION..];
                let len = data.len().min(MAX_ARRAY_PAYLOAD);
                u[ARRAY_TYPE] = *element_type;
                if *element_size > 0 {
                    put_u32(u, ARRAY_COUNT, len as u32 / *element_size);
                }
                put_u32(u, ARRAY_ELEMENT_SIZE, *element_size);
                put_u32(u, ARRAY_TOTAL_SIZE, len as u32);
                u[ARRAY_DATA..ARRAY_DATA + len].copy_from_slice(&data[..len]);
            }
            ResponseBody::Batch {
                count,
                success_mask,
                values,
            } => {
                let u = &mut frame[RESP_UNION..];
                u[BATCH_COUNT] = *count;
                put_u32(u, BATCH_MASK, *success_mask);
                for (i, value) in values.iter().take(MAX_BATCH_ENTRIES).enumerate() {
                    put_u64(u, BATCH_VALUES + i * 8, *value);
                }
            }
            ResponseBody::Heartbeat {
                client_timestamp,
                server_timestamp,
                latency_ms,
            } => {
                let u = &mut frame[RESP_UNION..];
                put_u32(u, HB_CLIENT, *client_timestamp);
                put_u32(u, HB_SERVER, *server_timestamp);
                put_u32(u, HB_LATENCY, *latency_ms);
            }
            ResponseBody::ServerStatus(status) => {
                let s = &mut frame[RESP_SERVER_STATUS..];
                put_i32(s, SRV_STATUS, i32::from(status.running));
                put_u32(s, SRV_CLIENTS, status.client_count);
                put_u64(s, SRV_UPTIME, status.uptime_ms);
                put_cstr(s, SRV_PIPE_NAME, PATTERN_FIELD_LEN, &status.pipe_name);
            }
            ResponseBody::LoaderStatus {
                state,
                version,
                build_info,
            } => {
                let s = &mut frame[RESP_LOADER_STATUS..];
                put_i32(s, LDR_STATE, *state);
                put_u32(s, LDR_VERSION, *version);
                put_cstr(s, LDR_BUILD_INFO, PATTERN_FIELD_LEN, build_info);
            }
        }

        put_cstr(&mut frame[..], RESP_ERROR, ERROR_FIELD_LEN, &self.error);
        frame
    }

    /// Decode a frame for the given request kind (controller side).
    ///
    /// The response body is a union, so the request kind picks the view.
    pub fn decode(frame: &[u8], request_kind: u32) -> crate::Result<Response> {
        if frame.len() != RESPONSE_LEN {
            return Err(Error::Ipc(format!(
                "Bad response frame length: {} (expected {})",
                frame.len(),
                RESPONSE_LEN
            )));
        }
        let success = frame[0] != 0;
        let error = get_cstr(frame, RESP_ERROR, ERROR_FIELD_LEN);
        let u = &frame[RESP_UNION..];

        let body = match request_kind {
            kind::SCAN_FIND
            | kind::SCAN_FIND_ASSERTION
            | kind::SCAN_FIND_IN_RANGE
            | kind::SCAN_TO_FUNCTION_START
            | kind::SCAN_FUNCTION_FROM_NEAR_CALL => ResponseBody::Scan {
                address: get_u32(u, SCAN_ADDRESS) as usize,
            },
            kind::CALL_FUNCTION => ResponseBody::Call {
                has_return: get_u8(u, CALL_HAS_RETURN) != 0,
                value: get_u32(u, CALL_VALUE),
            },
            kind::READ_MEMORY => {
                let size = (get_u32(u, MEMORY_SIZE) as usize).min(MAX_MEMORY_PAYLOAD);
                ResponseBody::Memory {
                    address: get_u32(u, MEMORY_ADDRESS) as usize,
                    data: u[MEMORY_DATA..MEMORY_DATA + size].to_vec(),
                }
            }
            kind::ALLOCATE_MEMORY => ResponseBody::Allocated {
                address: get_u32(u, MEMORY_ADDRESS) as usize,
                size: get_u32(u, MEMORY_SIZE) as usize,
            },
            kind::LIST_FUNCTIONS => {
                let count = (get_u32(u, LIST_COUNT) as usize).min(MAX_LISTED_FUNCTIONS);
                let names = (0..count)
                    .map(|i| get_cstr(u, LIST_NAMES + i * NAME_FIELD_LEN, NAME_FIELD_LEN))
                    .collect();
                ResponseBody::FunctionList { names }
            }
            kind::GET_SECTION_INFO => ResponseBody::SectionInfo {
                start: get_u32(u, SECTION_START) as usize,
                end: get_u32(u, SECTION_END) as usize,
            },
            kind::GET_PENDING_EVENTS => {
                let fit = EVENT_AREA_LEN / EVENT_RECORD_LEN;
                let count = (get_u32(u, EVENTS_COUNT) as usize).min(fit);
                let events = (0..count)
                    .map(|i| EventRecord::decode_from(&u[EVENTS_DATA + i * EVENT_RECORD_LEN..]))
                    .collect();
                ResponseBody::Events { events }
            }
            kind::READ_POINTER_CHAIN => ResponseBody::PointerChain {
                final_address: get_u32(u, CHAIN_FINAL_ADDRESS) as usize,
                value: get_u64(u, CHAIN_VALUE),
            },
            kind::READ_MEMORY_ARRAY => {
                let total = (get_u32(u, ARRAY_TOTAL_SIZE) as usize).min(MAX_ARRAY_PAYLOAD);
                ResponseBody::Array {
                    element_type: get_u8(u, ARRAY_TYPE),
                    element_size: get_u32(u, ARRAY_ELEMENT_SIZE),
                    data: u[ARRAY_DATA..ARRAY_DATA + total].to_vec(),
                }
            }
            kind::BATCH_READ_MEMORY => {
                let count = get_u8(u, BATCH_COUNT).min(MAX_BATCH_ENTRIES as u8);
                let values = (0..count as usize)
                    .map(|i| get_u64(u, BATCH_VALUES + i * 8))
                    .collect();
                ResponseBody::Batch {
                    count,
                    success_mask: get_u32(u, BATCH_MASK),
                    values,
                }
            }
            kind::HEARTBEAT => ResponseBody::Heartbeat {
                client_timestamp: get_u32(u, HB_CLIENT),
                server_timestamp: get_u32(u, HB_SERVER),
                latency_ms: get_u32(u, HB_LATENCY),
            },
            kind::SERVER_STATUS => {
                let s = &frame[RESP_SERVER_STATUS..];
                ResponseBody::ServerStatus(ServerStatus {
                    running: get_i32(s, SRV_STATUS) != 0,
                    client_count: get_u32(s, SRV_CLIENTS),
                    uptime_ms: get_u64(s, SRV_UPTIME),
                    pipe_name: get_cstr(s, SRV_PIPE_NAME, PATTERN_FIELD_LEN),
                })
            }
            kind::LOADER_STATUS => {
                let s = &frame[RESP_LOADER_STATUS..];
                ResponseBody::LoaderStatus {
                    state: get_i32(s, LDR_STATE),
                    version: get_u32(s, LDR_VERSION),
                    build_info: get_cstr(s, LDR_BUILD_INFO, PATTERN_FIELD_LEN),
                }
            }
            _ => ResponseBody::None,
        };

        Ok(Response {
            success,
            body,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(RESP_SERVER_STATUS, 2068);
        assert_eq!(RESP_LOADER_STATUS, 2340);
        assert_eq!(RESP_ERROR, 2604);
        assert_eq!(RESP_ERROR + ERROR_FIELD_LEN, RESPONSE_LEN);
    }

    #[test]
    fn test_failure_carries_error_message() {
        let response = Response::fail(&Error::NotFound("Pattern".to_string()));
        let frame = response.encode();
        assert_eq!(frame[0], 0);
        let back = Response::decode(&frame[..], kind::SCAN_FIND).unwrap();
        assert!(!back.success);
        assert_eq!(back.error, "Pattern not found");
    }

    #[test]
    fn test_error_message_is_truncated_to_field() {
        let long = "x".repeat(400);
        let response = Response::fail_message(long);
        let back = Response::decode(&response.encode()[..], kind::READ_MEMORY).unwrap();
        assert_eq!(back.error.len(), ERROR_FIELD_LEN - 1);
    }

    #[test]
    fn test_memory_result_roundtrip() {
        let response = Response::ok(ResponseBody::Memory {
            address: 0x0040_1000,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        });
        let back = Response::decode(&response.encode()[..], kind::READ_MEMORY).unwrap();
        assert!(back.success);
        assert_eq!(back.body, response.body);
        assert!(back.error.is_empty());
    }

    #[test]
    fn test_function_list_truncates_to_twenty() {
        let names: Vec<String> = (0..25).map(|i| format!("func_{}", i)).collect();
        let response = Response::ok(ResponseBody::FunctionList { names });
        let back = Response::decode(&response.encode()[..], kind::LIST_FUNCTIONS).unwrap();
        match back.body {
            ResponseBody::FunctionList { names } => {
                assert_eq!(names.len(), MAX_LISTED_FUNCTIONS);
                assert_eq!(names[0], "func_0");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_event_batch_respects_frame_space() {
        // Only three 268-byte records fit the 1024-byte area.
        let events: Vec<EventRecord> = (0..5)
            .map(|i| EventRecord {
                id: i,
                timestamp: 100 + i,
                data: vec![i as u8; 16],
            })
            .collect();
        let response = Response::ok(ResponseBody::Events { events });
        let back = Response::decode(&response.encode()[..], kind::GET_PENDING_EVENTS).unwrap();
        match back.body {
            ResponseBody::Events { events } => {
                assert_eq!(events.len(), 3);
                assert_eq!(events[0].id, 0);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_batch_result_roundtrip() {
        let response = Response::ok(ResponseBody::Batch {
            count: 5,
            success_mask: 0b01111,
            values: vec![0x00, 0x0302, 0x0706_0504, 0x0F0E_0D0C_0B0A_0908, 0],
        });
        let back = Response::decode(&response.encode()[..], kind::BATCH_READ_MEMORY).unwrap();
        assert_eq!(back.body, response.body);
    }

    #[test]
    fn test_server_status_outside_union() {
        let response = Response::ok(ResponseBody::ServerStatus(ServerStatus {
            running: true,
            client_count: 2,
            uptime_ms: 60_000,
            pipe_name: "\\\\.\\pipe\\GwNexus_1234".to_string(),
        }));
        let back = Response::decode(&response.encode()[..], kind::SERVER_STATUS).unwrap();
        assert_eq!(back.body, response.body);
    }

    #[test]
    fn test_pointer_chain_result_roundtrip() {
        let response = Response::ok(ResponseBody::PointerChain {
            final_address: 0x0040_2010,
            value: 0x1122_3344,
        });
        let back = Response::decode(&response.encode()[..], kind::READ_POINTER_CHAIN).unwrap();
        assert_eq!(back.body, response.body);
    }
}
