#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Hostile command/data streams must error out cleanly, and anything we
    // produced ourselves must invert exactly.
    let _ = entrans::unpredict_icc(data);

    if let Ok(enc) = entrans::predict_icc(data) {
        assert_eq!(entrans::unpredict_icc(&enc).as_deref(), Ok(data));
    }
});
