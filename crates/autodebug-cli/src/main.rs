use std::path::{Path, PathBuf};

use autodebug_core::{DEFAULT_ATTACH_TIMEOUT_MS, OutputMask, ReportOptions, SessionOptions};
use clap::{ArgAction, Parser};
use tracing::Level;

const USAGE: &str = "Usage: autodebug <memory-dump-filename>";

#[derive(Parser, Debug)]
#[command(name = "autodebug")]
#[command(about = "Run debugger commands and managed heap reports against a memory dump")]
struct Cli {
    /// Memory dump file to open
    dump: Option<PathBuf>,

    /// Command list to execute (defaults to commandlist.txt in the working directory)
    #[arg(short, long)]
    commands: Option<PathBuf>,

    /// Print only heap statistics instead of every object
    #[arg(long)]
    stats_only: bool,

    /// Skip the heap dump
    #[arg(long)]
    skip_heap: bool,

    /// Skip the AppDomain module listing
    #[arg(long)]
    skip_modules: bool,

    /// Load this DAC instead of the one next to the runtime in the dump
    #[arg(long)]
    dac: Option<PathBuf>,

    /// Milliseconds to wait for the engine to load the dump
    #[arg(long, default_value_t = DEFAULT_ATTACH_TIMEOUT_MS)]
    timeout: u32,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            attach_timeout_ms: self.timeout,
            output_mask: OutputMask::default(),
        }
    }

    fn report_options(&self) -> ReportOptions {
        ReportOptions {
            stats_only: self.stats_only,
            skip_heap: self.skip_heap,
            skip_modules: self.skip_modules,
        }
    }
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// The dump path, if it names an existing file.
fn existing_dump(dump: Option<&Path>) -> Option<&Path> {
    dump.filter(|path| path.is_file())
}

/// What to print when no usable dump was given.
fn missing_dump_message(dump: Option<&Path>) -> String {
    match dump {
        Some(path) => format!(
            "Unable to open [{}] or the file is missing.\n{}",
            path.display(),
            USAGE
        ),
        None => USAGE.to_string(),
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(log_level(cli.verbose))
        .with_target(false)
        .init();

    let Some(dump) = existing_dump(cli.dump.as_deref()) else {
        println!("{}", missing_dump_message(cli.dump.as_deref()));
        std::process::exit(1);
    };

    if let Err(e) = run(&cli, dump) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(windows)]
fn run(cli: &Cli, dump: &Path) -> autodebug_core::Result<()> {
    use std::io::Write;

    use autodebug_core::script::command_file_path;
    use autodebug_core::{
        CommandScript, DacRuntime, DebugSession, ManagedRuntime, discover_runtimes, report,
    };

    let session = DebugSession::open(dump, cli.session_options())?;
    let report_options = cli.report_options();

    tracing::info!("{}", session);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let script_path = command_file_path(cli.commands.as_deref())?;
    let script = CommandScript::load(&script_path)?;
    if script.is_empty() {
        tracing::info!(path = %script_path.display(), "no commands to run");
    }
    for command in script.commands() {
        writeln!(out, "[Command]> {}", command)?;
        let output = session.execute(command)?;
        writeln!(out, "{}", output)?;
    }

    let target = session.data_target_info()?;
    let clrs = discover_runtimes(&session)?;
    if clrs.is_empty() {
        tracing::warn!("no managed runtime found in dump");
    }
    report::write_clr_info(&mut out, &target, &clrs)?;

    let mut runtimes: Vec<Box<dyn ManagedRuntime>> = Vec::with_capacity(clrs.len());
    for info in clrs {
        let url = info.dac_symbol_server_url();
        match DacRuntime::load(&session, info, cli.dac.as_deref()) {
            Ok(runtime) => runtimes.push(Box::new(runtime)),
            Err(e) => {
                eprintln!("Error: {}", e);
                tracing::warn!(dac_url = %url, "skipping runtime without a usable DAC");
            }
        }
    }

    if !report_options.skip_heap {
        report::write_heap(&mut out, &runtimes, report_options.stats_only)?;
    }
    if !report_options.skip_modules {
        report::write_modules(&mut out, &runtimes)?;
    }
    out.flush()?;

    // Runtimes hold references into the engine; release them before the session.
    drop(runtimes);
    drop(session);
    Ok(())
}

#[cfg(not(windows))]
fn run(cli: &Cli, dump: &Path) -> autodebug_core::Result<()> {
    tracing::debug!(dump = %dump.display(), options = ?cli.report_options(), "refusing to open dump");
    Err(autodebug_core::Error::Session(
        "the debugger engine (dbgeng.dll) is only available on Windows".into(),
    ))
}
