#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(program) = rove_asm::parse(s) {
            let once = rove_asm::pretty_print(&program);
            let reparsed = rove_asm::parse(&once).expect("disassembly must parse");
            assert_eq!(once, rove_asm::pretty_print(&reparsed));
        }
    }
});
