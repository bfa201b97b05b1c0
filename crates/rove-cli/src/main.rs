//! Command-line interface for the rove model checker.

use clap::{Args, Parser, Subcommand};
use miette::{Diagnostic, NamedSource, SourceSpan};
use notify::{RecursiveMode, Watcher};
use rove_asm::{parse, pretty_print};
use rove_ir::Program;
use rove_mc::{
    replay, ChoiceTrace, ExecTracker, ListenerBus, NoUncaughtExceptions, NotDeadlocked,
    ProgressCounters, RaceDetector, RunConfig, Search, SearchReport, SearchStatus,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI error with source context for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("failed to read {path}: {message}")]
    IoError { path: String, message: String },

    #[error("parse error: {message}")]
    #[diagnostic(code(rove::parse_error))]
    ParseError {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("invalid program: {message}")]
    #[diagnostic(code(rove::metadata_error))]
    MetadataError { message: String },

    #[error("configuration error: {message}")]
    #[diagnostic(code(rove::config_error), help("see `rove check --help` for options"))]
    ConfigError { message: String },

    #[error("check error: {message}")]
    CheckError { message: String },

    #[error("replay error: {message}")]
    #[diagnostic(code(rove::replay_error))]
    ReplayError { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl CliError {
    fn from_parse_error(e: rove_asm::ParseError, source: Arc<String>, filename: &str) -> Self {
        let span = e.span();
        CliError::ParseError {
            message: e.to_string(),
            src: NamedSource::new(filename, source),
            span: (span.start, span.end.saturating_sub(span.start)).into(),
        }
    }
}

impl From<rove_mc::ConfigError> for CliError {
    fn from(e: rove_mc::ConfigError) -> Self {
        CliError::ConfigError {
            message: e.to_string(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "rove", version)]
#[command(about = "Explicit-state model checker for concurrent programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a program and list its classes
    Parse {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a program in canonical assembly form
    Disasm {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Model check a program
    Check {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        options: CheckOptions,

        /// Write the trace of the first violation to this file
        #[arg(long, value_name = "FILE")]
        trace_out: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Re-execute a program along a recorded choice trace
    Replay {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Trace written by `rove check --trace-out`
        #[arg(long, value_name = "TRACE")]
        trace: PathBuf,

        #[command(flatten)]
        options: CheckOptions,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Watch a program and re-check on changes
    Watch {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        options: CheckOptions,
    },
}

/// Search and VM options. Every flag is a shorthand for one `-o key=value`.
#[derive(Args, Clone, Default)]
struct CheckOptions {
    /// Maximum number of states to explore (0 = unlimited)
    #[arg(long)]
    max_states: Option<usize>,

    /// Maximum depth to explore (0 = unlimited)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Time limit in seconds (0 = unlimited)
    #[arg(long)]
    time_limit: Option<u64>,

    /// Maximum memory usage in MB (0 = unlimited)
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Search order: dfs, bfs or random
    #[arg(long, value_name = "ORDER")]
    search: Option<String>,

    /// Seed for the random search order
    #[arg(long)]
    seed: Option<u64>,

    /// Explore every path instead of skipping visited states
    #[arg(long)]
    no_state_matching: bool,

    /// Revisit states reached again at a smaller depth
    #[arg(long)]
    match_depth: bool,

    /// Keep searching after a violation
    #[arg(long)]
    multiple_errors: bool,

    /// Disable deadlock checking
    #[arg(long)]
    no_deadlock: bool,

    /// Report unsynchronized accesses to shared data
    #[arg(long)]
    races: bool,

    /// Report states that repeat on a depth-first path
    #[arg(long)]
    cycles: bool,

    /// Scheduling policy: all or reduced
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,

    /// State serializer: heap or canonical
    #[arg(long, value_name = "KIND")]
    serializer: Option<String>,

    /// Perturb the arguments of a method (Class.method or Class.method(desc))
    #[arg(long, value_name = "METHOD")]
    perturb: Vec<String>,

    /// Throw an exception at a call or instruction (Exc[("detail")]@Class.method[(desc)][:pc])
    #[arg(long, value_name = "SPEC")]
    inject: Vec<String>,

    /// Backward jumps in one transition before a loop counts as idle (0 = off)
    #[arg(long, value_name = "N")]
    idle_limit: Option<usize>,

    /// What to do with an idle loop: warn, break, yield, prune or jump
    #[arg(long, value_name = "ACTION")]
    idle_action: Option<String>,

    /// Longest array the program may allocate
    #[arg(long, value_name = "N")]
    max_array_length: Option<usize>,

    /// Parallel breadth-first search
    #[arg(long)]
    parallel: bool,

    /// Number of threads for parallel search (0 = use all available)
    #[arg(long)]
    threads: Option<usize>,

    /// Properties file with `key = value` options
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Option as key=value, applied after all other options
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    option: Vec<String>,
}

impl CheckOptions {
    /// Build the run configuration: properties file, then flags, then `-o`.
    fn run_config(&self) -> CliResult<RunConfig> {
        let mut config = RunConfig::new();
        if let Some(path) = &self.config {
            config.apply_properties_str(&read_file(path)?)?;
        }
        for (key, value) in self.flag_pairs() {
            config.apply(key, &value)?;
        }
        for option in &self.option {
            config.apply_option(option)?;
        }
        Ok(config)
    }

    fn flag_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        // the seed goes first so a random order picks it up
        if let Some(v) = self.seed {
            pairs.push(("search.seed", v.to_string()));
        }
        if let Some(v) = &self.search {
            pairs.push(("search.order", v.clone()));
        }
        if let Some(v) = self.max_states {
            pairs.push(("search.max_states", v.to_string()));
        }
        if let Some(v) = self.max_depth {
            pairs.push(("search.depth_limit", v.to_string()));
        }
        if let Some(v) = self.time_limit {
            pairs.push(("search.time_limit", v.to_string()));
        }
        if let Some(v) = self.memory_limit {
            pairs.push(("search.memory_limit", v.to_string()));
        }
        if self.no_state_matching {
            pairs.push(("search.match_state", "false".into()));
        }
        if self.match_depth {
            pairs.push(("search.match_depth", "true".into()));
        }
        if self.multiple_errors {
            pairs.push(("search.multiple_errors", "true".into()));
        }
        if self.no_deadlock {
            pairs.push(("search.check_deadlock", "false".into()));
        }
        if self.races {
            pairs.push(("search.check_races", "true".into()));
        }
        if self.cycles {
            pairs.push(("search.check_cycles", "true".into()));
        }
        if let Some(v) = &self.policy {
            pairs.push(("vm.scheduling", v.clone()));
        }
        if let Some(v) = &self.serializer {
            pairs.push(("search.serializer", v.clone()));
        }
        if !self.perturb.is_empty() {
            pairs.push(("perturb.methods", self.perturb.join(",")));
        }
        if !self.inject.is_empty() {
            pairs.push(("vm.inject", self.inject.join(";")));
        }
        if let Some(v) = self.idle_limit {
            pairs.push(("idle.max_backjumps", v.to_string()));
        }
        if let Some(v) = &self.idle_action {
            pairs.push(("idle.action", v.clone()));
        }
        if let Some(v) = self.max_array_length {
            pairs.push(("vm.max_array_length", v.to_string()));
        }
        if self.parallel {
            pairs.push(("search.parallel", "true".into()));
        }
        if let Some(v) = self.threads {
            pairs.push(("search.threads", v.to_string()));
        }
        pairs
    }
}

fn main() {
    // Install miette's fancy error handler
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let cli = Cli::parse();

    let filter = if matches!(
        &cli.command,
        Commands::Parse { verbose: true, .. }
            | Commands::Check { verbose: true, .. }
            | Commands::Replay { verbose: true, .. }
    ) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Parse { file, verbose } => cmd_parse(&file, verbose),
        Commands::Disasm { file } => cmd_disasm(&file),
        Commands::Check {
            file,
            options,
            trace_out,
            json,
            verbose,
        } => cmd_check(&file, &options, trace_out.as_deref(), json, verbose),
        Commands::Replay {
            file,
            trace,
            options,
            verbose,
        } => cmd_replay(&file, &trace, &options, verbose),
        Commands::Watch { file, options } => cmd_watch(&file, &options),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    }
}

fn read_file(path: &Path) -> CliResult<String> {
    fs::read_to_string(path).map_err(|e| CliError::IoError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn load_program(file: &Path) -> CliResult<Program> {
    let filename = file.display().to_string();
    let source = Arc::new(read_file(file)?);
    let program =
        parse(&source).map_err(|e| CliError::from_parse_error(e, source.clone(), &filename))?;
    rove_ir::check_program(&program).map_err(|e| CliError::MetadataError {
        message: e.to_string(),
    })?;
    Ok(program)
}

fn cmd_parse(file: &Path, verbose: bool) -> CliResult<i32> {
    let program = load_program(file)?;

    for class in program.user_classes() {
        match class.superclass.map(|s| program.class(s)) {
            Some(sup) => println!("class {} extends {}", class.name, sup.name),
            None => println!("class {}", class.name),
        }
        println!(
            "  {} fields, {} static fields, {} methods",
            class.fields.len(),
            class.static_fields.len(),
            class.methods.len()
        );
        if verbose {
            for method in &class.methods {
                println!(
                    "    {}{} ({} insns, {} locals)",
                    method.name,
                    method.sig,
                    method.code.len(),
                    method.max_locals
                );
            }
        }
    }
    if let Some(entry) = program.entry() {
        println!("entry {}", program.method(entry));
    }

    println!("parse: ok");
    Ok(0)
}

fn cmd_disasm(file: &Path) -> CliResult<i32> {
    let program = load_program(file)?;
    print!("{}", pretty_print(&program));
    Ok(0)
}

fn cmd_check(
    file: &Path,
    options: &CheckOptions,
    trace_out: Option<&Path>,
    json: bool,
    verbose: bool,
) -> CliResult<i32> {
    let mut config = options.run_config()?;

    info!("parsing...");
    let program = Arc::new(load_program(file)?);

    let progress = Arc::new(ProgressCounters::new());
    config.search.progress = Some(Arc::clone(&progress));

    info!("model checking...");
    let start = Instant::now();
    let mut search = Search::new(program, config.vm, config.search);
    if verbose {
        search.add_listener(ExecTracker);
    }

    let done = AtomicBool::new(false);
    let report = std::thread::scope(|s| {
        s.spawn(|| report_progress(&progress, &done));
        let report = search.run();
        done.store(true, Ordering::Relaxed);
        report
    })
    .map_err(|e| CliError::CheckError {
        message: e.to_string(),
    })?;
    let elapsed = start.elapsed();

    if let (Some(path), Some(violation)) = (trace_out, report.violations.first()) {
        fs::write(path, violation.trace.to_json()).map_err(|e| CliError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        info!(path = %path.display(), "trace written");
    }

    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|e| CliError::Other {
            message: e.to_string(),
        })?;
        println!("{text}");
    } else {
        print_report(&report, elapsed);
    }
    Ok(exit_code(&report))
}

/// Log progress every few seconds until `done` is set.
fn report_progress(progress: &ProgressCounters, done: &AtomicBool) {
    let mut last = Instant::now();
    while !done.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
        if last.elapsed() >= Duration::from_secs(5) {
            last = Instant::now();
            info!(
                states = progress.states.load(Ordering::Relaxed),
                depth = progress.depth.load(Ordering::Relaxed),
                queue = progress.queue_len.load(Ordering::Relaxed),
                transitions = progress.transitions.load(Ordering::Relaxed),
                "progress"
            );
        }
    }
}

fn exit_code(report: &SearchReport) -> i32 {
    if report.has_violations() {
        1
    } else if let SearchStatus::Incomplete(_) = report.status {
        2
    } else {
        0
    }
}

fn print_report(report: &SearchReport, elapsed: Duration) {
    let stats = &report.stats;
    println!();
    match (&report.status, report.has_violations()) {
        (_, true) => println!("Result: VIOLATION ({})", report.status),
        (SearchStatus::Complete, false) => println!("Result: OK"),
        (status, false) => println!("Result: {}", status.to_string().to_uppercase()),
    }
    for (n, violation) in report.violations.iter().enumerate() {
        println!("  Violation {}: {}", n + 1, violation.property);
        println!("    {}", violation.message);
        println!("    Depth: {}", violation.depth);
        println!("    State: {}", violation.fingerprint);
        println!("    Trace ({} choices):", violation.trace.len());
        for (i, step) in violation.trace.steps().iter().enumerate() {
            println!("      {}: {}[{}]", i, step.id, step.index);
        }
    }
    println!("  States: {} new, {} revisited", stats.states, stats.revisited);
    println!("  End states: {}", stats.end_states);
    println!("  Transitions: {}", stats.transitions);
    println!("  Max depth: {}", stats.max_depth);
    println!("  Instructions: {}", stats.instructions);
    if stats.collisions > 0 {
        println!("  Fingerprint collisions: {}", stats.collisions);
    }
    println!("  Time: {:.2}s", elapsed.as_secs_f64());
    println!(
        "  States/sec: {:.0}",
        stats.states as f64 / elapsed.as_secs_f64().max(1e-6)
    );
}

fn cmd_replay(
    file: &Path,
    trace_file: &Path,
    options: &CheckOptions,
    verbose: bool,
) -> CliResult<i32> {
    let config = options.run_config()?;
    let program = Arc::new(load_program(file)?);
    let trace = ChoiceTrace::from_json(&read_file(trace_file)?).map_err(|e| {
        CliError::ReplayError {
            message: e.to_string(),
        }
    })?;

    let mut bus = ListenerBus::new();
    bus.add(NoUncaughtExceptions);
    if config.search.check_deadlock {
        bus.add(NotDeadlocked);
    }
    if config.search.check_races {
        bus.add(RaceDetector);
    }
    if verbose {
        bus.add(ExecTracker);
    }
    let report =
        replay(program, config.vm, &trace, &mut bus).map_err(|e| CliError::ReplayError {
            message: e.to_string(),
        })?;

    for line in &report.output {
        println!("{line}");
    }
    println!();
    println!("Replayed {} transitions ({} choices)", report.steps, trace.len());
    println!("  State: {}", report.fingerprint);
    match &report.violation {
        Some(v) => {
            println!("  Violation: {v}");
            Ok(1)
        }
        None => {
            println!("  No violation");
            Ok(0)
        }
    }
}

fn cmd_watch(file: &Path, options: &CheckOptions) -> CliResult<i32> {
    println!(
        "Watching {} for changes... (Ctrl+C to stop)",
        file.display()
    );
    println!();

    let (tx, rx) = mpsc::channel();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if event.kind.is_modify() {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| CliError::Other {
            message: format!("failed to create file watcher: {}", e),
        })?;

    watcher
        .watch(file, RecursiveMode::NonRecursive)
        .map_err(|e| CliError::Other {
            message: format!("failed to watch file: {}", e),
        })?;

    run_check_iteration(file, options);

    loop {
        if rx.recv().is_err() {
            break;
        }

        // Debounce: wait a bit and drain any additional events
        std::thread::sleep(Duration::from_millis(100));
        while rx.try_recv().is_ok() {}

        // Clear screen
        print!("\x1B[2J\x1B[H");

        run_check_iteration(file, options);
    }

    Ok(0)
}

/// Run one check, printing errors instead of returning them.
fn run_check_iteration(file: &Path, options: &CheckOptions) {
    let result = options.run_config().and_then(|config| {
        let program = Arc::new(load_program(file)?);
        let start = Instant::now();
        let report = Search::new(program, config.vm, config.search)
            .run()
            .map_err(|e| CliError::CheckError {
                message: e.to_string(),
            })?;
        Ok((report, start.elapsed()))
    });
    match result {
        Ok((report, elapsed)) => print_report(&report, elapsed),
        Err(e) => eprintln!("{:?}", miette::Report::new(e)),
    }

    println!();
    println!("Watching for changes...");
}
