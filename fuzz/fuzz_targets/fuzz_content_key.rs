//! Fuzz target for content key path-segment encoding.
//!
//! Decoding must never panic, anything it accepts must encode back to a
//! segment that decodes to the same key, and any hash must survive the
//! trip as a single path segment.

#![no_main]

use channel_hub::content::ContentKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (i64, &str)| {
    let (sequence, text) = input;

    if let Some(key) = ContentKey::from_path_segment(text) {
        let reencoded = key.to_path_segment();
        assert_eq!(ContentKey::from_path_segment(&reencoded), Some(key));
    }

    let key = ContentKey::new(sequence, text);
    let segment = key.to_path_segment();
    assert!(!segment.contains('/'));
    assert_eq!(ContentKey::from_path_segment(&segment), Some(key));
});
