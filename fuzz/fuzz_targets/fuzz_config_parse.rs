#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Parsing must never panic, and anything that parses must validate
        // and serialize back without panicking either.
        if let Ok(config) = nanobot::config::Config::from_json_str(s) {
            let _ = config.validate();
            let _ = config.active_provider_name();
            let _ = config.to_masked_json();
        }
    }
});
