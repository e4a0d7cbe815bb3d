#![no_main]

use std::{io::Cursor, ops::ControlFlow};

use libfuzzer_sys::fuzz_target;
use wavepeek_fst::fst::FstReader;

// Any input may be rejected, but none may panic or hang.
fuzz_target!(|data: &[u8]| {
    if let Ok(mut reader) = FstReader::new(Cursor::new(data)) {
        reader.set_process_mask_all();
        let _ = reader.read_value_changes(0, u64::MAX, |_, _, _| ControlFlow::Continue(()));
    }
});
