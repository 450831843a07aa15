//! Fuzz target: `FrameDecoder`
//!
//! Feeds arbitrary bytes to both decoder kinds, split at a point taken
//! from the input, and checks that every yielded frame respects the
//! payload limit and parses without panicking.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use memsync::protocol::{FrameDecoder, FrameKind, Request, Response};

const MAX_PAYLOAD: usize = 256;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let cut = usize::from(split).min(rest.len());

    for kind in [FrameKind::Request, FrameKind::Response] {
        let mut decoder = FrameDecoder::new(kind, MAX_PAYLOAD);
        decoder.feed(&rest[..cut]);
        drain(&mut decoder, kind);
        decoder.feed(&rest[cut..]);
        drain(&mut decoder, kind);

        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
    }
});

fn drain(decoder: &mut FrameDecoder, kind: FrameKind) {
    while let Some(frame) = decoder.next_frame() {
        let Ok(frame) = frame else { continue };
        match kind {
            FrameKind::Request => {
                if let Ok(req) = Request::from_bytes(&frame) {
                    assert!(req.payload.len() <= MAX_PAYLOAD);
                }
            }
            FrameKind::Response => {
                if let Ok(resp) = Response::from_bytes(&frame) {
                    assert!(resp.payload.len() <= MAX_PAYLOAD);
                }
            }
        }
    }
}
