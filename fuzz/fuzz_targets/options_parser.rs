#![no_main]

use hooktime::config::ProfilerOptions;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and validation must reject bad input without panicking
        if let Ok(options) = ProfilerOptions::from_toml_str(input) {
            assert!(options.validate().is_ok());
            let _ = options.policy();
        }
    }
});
