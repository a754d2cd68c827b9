//! Fuzz target for TOML config parsing.
//!
//! Feeds arbitrary UTF-8 to `LoadTestConfig::from_toml()` and, when that
//! succeeds, compiles the scenario. Errors are expected; panics are not.
//!
//! Run with: `cargo +nightly fuzz run fuzz_config_parse`

#![no_main]
use libfuzzer_sys::fuzz_target;

use stampede::loadtest::config::LoadTestConfig;
use stampede::loadtest::scenario::ScenarioWorkload;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = LoadTestConfig::from_toml(s) {
            let _ = ScenarioWorkload::from_config(&config);
        }
    }
});
