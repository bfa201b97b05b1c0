#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(program) = rove_asm::parse(s) {
            let _ = rove_ir::check_program(&program);
        }
    }
});
