//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`, covering both TOML
//! decoding and endpoint validation (modes, paths, delimiters).

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = eventgate_config::AppConfig::parse(s) {
            for endpoint in &config.endpoints {
                let _ = endpoint.mode_bits();
                let _ = endpoint.delimiter_byte();
            }
        }
    }
});
