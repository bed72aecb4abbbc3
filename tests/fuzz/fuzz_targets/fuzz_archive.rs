#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed chunks degrade to empty lines; reading must never panic.
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (archive, manifest) = text.split_once('\u{0}').unwrap_or((text, "{}"));
    if let Ok(report) = covstore::report::Report::from_json(archive, manifest) {
        let _ = report.totals();
        for file in report.iter() {
            let _ = file.lines().count();
        }
        let _ = report.to_json();
    }
});
