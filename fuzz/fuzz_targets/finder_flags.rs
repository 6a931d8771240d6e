#![no_main]

use libfuzzer_sys::fuzz_target;
use ninebridge::multifork::flags::{flags_to_text, text_to_flags};

// Arbitrary sidecar text must parse without panicking, and whatever it
// parses to must re-render and re-parse to the same flags.
fuzz_target!(|data: &[u8]| {
    let (finfo, fxinfo) = text_to_flags(data);
    let text = flags_to_text(&finfo, &fxinfo);
    let (again, _) = text_to_flags(&text);
    assert_eq!(finfo, again);
});
