//! Integration tests over the programs in `demos/`.

use rove_mc::{NoUncaughtExceptions, NotDeadlocked, Search, SearchConfig, SearchStatus};
use rove_vm::VmConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

fn demos_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("demos")
}

fn find_rove_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |e| e == "rove"))
        .collect();
    files.sort();
    files
}

fn demo(name: &str) -> PathBuf {
    demos_dir().join(name)
}

fn rove(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rove"))
        .args(args)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rove-{}-{name}", std::process::id()))
}

#[test]
fn all_demos_parse() {
    let files = find_rove_files(&demos_dir());
    assert!(!files.is_empty(), "no .rove files found");

    let mut failures = Vec::new();
    for file in &files {
        let source = fs::read_to_string(file).unwrap();
        match rove_asm::parse(&source) {
            Ok(program) => {
                if let Err(e) = rove_ir::check_program(&program) {
                    failures.push(format!("{}: {e}", file.display()));
                }
            }
            Err(e) => failures.push(format!("{}: {e}", file.display())),
        }
    }
    if !failures.is_empty() {
        panic!("parse failures:\n{}", failures.join("\n"));
    }
}

#[test]
fn all_demos_disassemble_to_equivalent_programs() {
    for file in find_rove_files(&demos_dir()) {
        let source = fs::read_to_string(&file).unwrap();
        let program = rove_asm::parse(&source).unwrap();
        let text = rove_asm::pretty_print(&program);
        let again = rove_asm::parse(&text)
            .unwrap_or_else(|e| panic!("{}: reparse failed: {e}\n{text}", file.display()));
        assert_eq!(
            rove_asm::pretty_print(&again),
            text,
            "{}",
            file.display()
        );
    }
}

#[test]
fn all_demos_check_within_limits() {
    for file in find_rove_files(&demos_dir()) {
        let source = fs::read_to_string(&file).unwrap();
        let program = Arc::new(rove_asm::parse(&source).unwrap());
        let config = SearchConfig {
            max_states: 10_000,
            max_time_secs: 10,
            ..SearchConfig::default()
        };
        let report = Search::new(program, VmConfig::default(), config)
            .run()
            .unwrap_or_else(|e| panic!("{}: {e}", file.display()));
        assert!(
            report.is_complete() || report.status == SearchStatus::Halted,
            "{}: {}",
            file.display(),
            report.status
        );
    }
}

#[test]
fn expected_verdicts() {
    let cases = [
        ("racy_counter.rove", Some(NoUncaughtExceptions::NAME)),
        ("locked_counter.rove", None),
        ("lock_inversion.rove", Some(NotDeadlocked::NAME)),
        ("handoff.rove", None),
        ("choices.rove", None),
    ];
    for (name, expected) in cases {
        let source = fs::read_to_string(demo(name)).unwrap();
        let program = Arc::new(rove_asm::parse(&source).unwrap());
        let report = Search::new(program, VmConfig::default(), SearchConfig::default())
            .run()
            .unwrap();
        let found = report.violations.first().map(|v| v.property.as_str());
        assert_eq!(found, expected, "{name}");
    }
}

// === Binary ===

#[test]
fn cli_parse_lists_classes() {
    let out = rove(&["parse", demo("racy_counter.rove").to_str().unwrap()]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("class Main"), "{text}");
    assert!(text.contains("class Worker extends Thread"), "{text}");
    assert!(text.contains("entry Main.main"), "{text}");
    assert!(text.contains("parse: ok"), "{text}");
}

#[test]
fn cli_parse_error_exits_with_failure() {
    let path = temp_path("broken.rove");
    fs::write(&path, "class T\n  static method main()V\n    frobnicate\n  end\nend\n").unwrap();
    let out = rove(&["parse", path.to_str().unwrap()]);
    fs::remove_file(&path).ok();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("frobnicate"));
}

#[test]
fn cli_check_passes_locked_counter() {
    let out = rove(&["check", demo("locked_counter.rove").to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("Result: OK"));
}

#[test]
fn cli_check_reports_lost_update() {
    let out = rove(&["check", demo("racy_counter.rove").to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let text = stdout(&out);
    assert!(text.contains("Result: VIOLATION"), "{text}");
    assert!(text.contains(NoUncaughtExceptions::NAME), "{text}");
    assert!(text.contains("ROOT[0]"), "{text}");
}

#[test]
fn cli_check_json_report() {
    let out = rove(&[
        "check",
        demo("lock_inversion.rove").to_str().unwrap(),
        "--json",
        "--multiple-errors",
        "--search",
        "bfs",
    ]);
    assert_eq!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["status"], "complete");
    let violations = report["violations"].as_array().unwrap();
    assert!(!violations.is_empty());
    assert_eq!(violations[0]["property"], NotDeadlocked::NAME);
    assert!(violations[0]["trace"].as_array().is_some());
}

#[test]
fn cli_state_limit_exits_with_two() {
    let out = rove(&[
        "check",
        demo("locked_counter.rove").to_str().unwrap(),
        "--max-states",
        "2",
    ]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stdout(&out).contains("STATE LIMIT"));
}

#[test]
fn cli_rejects_unknown_option() {
    let out = rove(&[
        "check",
        demo("choices.rove").to_str().unwrap(),
        "-o",
        "search.flavour=mild",
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("search.flavour"));
}

#[test]
fn cli_config_file_and_overrides() {
    let out = rove(&[
        "check",
        demo("lock_inversion.rove").to_str().unwrap(),
        "--config",
        demo("search.properties").to_str().unwrap(),
        "-o",
        "search.check_deadlock=false",
    ]);
    assert_eq!(out.status.code(), Some(0), "{}", stdout(&out));
}

#[test]
fn cli_trace_replays_violation() {
    let trace = temp_path("racy.trace.json");
    let file = demo("racy_counter.rove");
    let out = rove(&[
        "check",
        file.to_str().unwrap(),
        "--trace-out",
        trace.to_str().unwrap(),
        "--json",
    ]);
    assert_eq!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let fingerprint = report["violations"][0]["fingerprint"].as_str().unwrap().to_string();

    let out = rove(&[
        "replay",
        file.to_str().unwrap(),
        "--trace",
        trace.to_str().unwrap(),
    ]);
    fs::remove_file(&trace).ok();
    assert_eq!(out.status.code(), Some(1));
    let text = stdout(&out);
    assert!(text.contains(&fingerprint), "{text}");
    assert!(text.contains("Violation: NoUncaughtExceptions"), "{text}");
    // the lost update prints 1
    assert!(text.lines().next() == Some("1"), "{text}");
}

#[test]
fn cli_races_flag_reports_race() {
    let out = rove(&[
        "check",
        demo("racy_counter.rove").to_str().unwrap(),
        "--races",
        "--json",
    ]);
    assert_eq!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["violations"][0]["property"], "RaceDetector");
}

#[test]
fn cli_inject_flag_throws_in_worker() {
    let out = rove(&[
        "check",
        demo("locked_counter.rove").to_str().unwrap(),
        "--inject",
        "RuntimeException@Worker.run:0",
        "--json",
    ]);
    assert_eq!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let message = report["violations"][0]["message"].as_str().unwrap();
    assert!(message.contains("uncaught RuntimeException"), "{message}");
}
