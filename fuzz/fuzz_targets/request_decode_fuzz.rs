//! Fuzz test for the request decoder
//!
//! Feeds arbitrary bytes to the server side of the update queue channel.
//! Decoding must end in a request, a clean end of stream or a
//! `ChannelError`, never a panic, and every decoded request must encode back
//! to a frame that decodes to the same request.
//!
//! Run with: cargo +nightly fuzz run request_decode_fuzz -- -max_total_time=60

#![no_main]

use coherence_wire::{FrameReader, Request, WireLimits};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    runtime.block_on(async {
        let mut reader = FrameReader::new(data, WireLimits::default());
        while let Ok(Some(request)) = Request::read(&mut reader).await {
            let bytes = request.to_bytes();
            let mut again = FrameReader::new(&bytes[..], WireLimits::default());
            let decoded = Request::read(&mut again)
                .await
                .expect("re-encoded request must decode");
            assert_eq!(decoded, Some(request));
        }
    });
});
