//! Fuzz target: `ProtocolCodec` payload parsing
//!
//! Treats the input as a command byte, a subfunction byte and a payload.
//! The payload is parsed both as a request and as the OK response to that
//! request; neither may panic whatever the bytes claim.
//!
//! cargo fuzz run fuzz_response_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use memsync::protocol::{AddressSize, ProtocolCodec, Request, Response, ResponseCode};

fuzz_target!(|data: &[u8]| {
    let [command, subfn, addr, payload @ ..] = data else {
        return;
    };
    let Some(address_size) = AddressSize::from_bytes(1 << (addr % 4)) else {
        return;
    };
    let codec = ProtocolCodec::new(address_size);

    let request = Request {
        command: command & 0x7F,
        subfn: *subfn,
        payload: payload.to_vec(),
    };
    let _ = codec.parse_request(&request);

    let response = Response::new(request.command, request.subfn, ResponseCode::Ok, payload.to_vec());
    let _ = codec.parse_response(&request, &response);
});
