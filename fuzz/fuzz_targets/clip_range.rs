//! Fuzz target for the range-clipping function.
//!
//! Checks the taxonomy postconditions over arbitrary (want, have) pairs.

#![no_main]

use audiosonde::buffer::clip_range;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (i32, u16, i32, u16)| {
    let (want_begin, want_len, have_begin, have_len) = (
        i64::from(input.0),
        i64::from(input.1),
        i64::from(input.2),
        i64::from(input.3),
    );

    let (clip, begin, len) = clip_range(want_begin, want_len, have_begin, have_len);

    // The result always lies within the available range.
    assert!(len >= 0 && len <= have_len);
    assert!(begin >= have_begin && begin + len <= have_begin + have_len);

    // For non-degenerate inputs, emptiness and the no-overlap classes
    // coincide.
    if want_len > 0 && have_len > 0 {
        assert_eq!(clip.is_empty(), len == 0);
    }
});
