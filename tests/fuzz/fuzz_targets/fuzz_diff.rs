#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Diff parser must not panic on any input, and every parsed hunk must
    // yield added lines without overflowing.
    if let Ok(s) = std::str::from_utf8(data) {
        let diff = covstore::diff::parse_unified_diff(s);
        for file in diff.files.values() {
            for segment in &file.segments {
                let _ = segment.added_lines();
            }
        }
    }
});
