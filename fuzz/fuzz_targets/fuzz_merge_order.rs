//! Fuzz target for tag merge windows.
//!
//! Whatever the per-channel inputs, the selected window is ascending,
//! duplicate free, and no longer than the requested count.

#![no_main]

use channel_hub::content::{ChannelContentKey, ContentKey};
use channel_hub::merger::select_window;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;

fuzz_target!(|data: (Vec<(u8, i64)>, bool, u8)| {
    let (entries, ascending, count) = data;
    let count = count as usize;

    let merged: BTreeSet<ChannelContentKey> = entries
        .into_iter()
        .map(|(channel, sequence)| {
            ChannelContentKey::new(format!("c{}", channel % 4), ContentKey::from_sequence(sequence))
        })
        .collect();
    let total = merged.len();

    let window = select_window(merged, ascending, count);
    assert!(window.len() <= count);
    assert_eq!(window.len(), total.min(count));
    assert!(window.windows(2).all(|pair| pair[0] < pair[1]));
});
