#![no_main]
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(program) = rove_asm::parse(s) {
            let config = rove_mc::SearchConfig {
                max_states: 1_000,
                max_depth: 50,
                max_time_secs: 2,
                ..rove_mc::SearchConfig::default()
            };
            let vm_config = rove_vm::VmConfig {
                max_transition_length: 10_000,
                ..rove_vm::VmConfig::default()
            };
            let mut search = rove_mc::Search::new(Arc::new(program), vm_config, config);
            let _ = search.run();
        }
    }
});
