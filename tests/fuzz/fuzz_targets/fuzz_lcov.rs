#![no_main]
use covstore::ingest::{self, Upload};
use covstore::parsers::Parser;
use covstore::report::Report;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(parsed) = covstore::parsers::lcov::LcovParser.parse(data) else {
        return;
    };
    let mut report = Report::new();
    let _ = ingest::add_upload(&mut report, &parsed, &Upload::default());
});
