#![no_main]

use libfuzzer_sys::fuzz_target;
use ninebridge::sortdir::Replay;

// The replay cache must survive unpacking arbitrary bytes.
fuzz_target!(|data: &[u8]| {
    let mut replay = Replay::from_bytes(data);
    while replay.unpack().is_some() {}
});
