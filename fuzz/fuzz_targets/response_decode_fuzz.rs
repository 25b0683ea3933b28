//! Fuzz test for the response decoder
//!
//! The node side reads one response frame per request; arbitrary bytes must
//! never make it panic.
//!
//! Run with: cargo +nightly fuzz run response_decode_fuzz -- -max_total_time=60

#![no_main]

use coherence_wire::{FrameReader, Response, WireLimits};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    runtime.block_on(async {
        let mut reader = FrameReader::new(data, WireLimits::default());
        while let Ok(Some(_response)) = Response::read(&mut reader).await {}
    });
});
