use std::{
    fs::File,
    io::BufWriter,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use pyro_show_core::{
    protocol::unix_now, AppConfig, ExecutionClock, ExecutionSummary, PacketLogTransport,
    SafetyInterlock, ShowError, ShowExecutionManager, ShowHandle, ShowState, SimulatedTransport,
    TimingStats, Transport, WaitOutcome,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let report = match run(&cli) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(%err, "show execution failed");
            Report::failure(err.to_string())
        }
    };

    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::error!(%err, "failed to serialize the result"),
    }
    if report.status == Status::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run(cli: &Cli) -> pyro_show_core::Result<Report> {
    let config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };

    let transport: Arc<dyn Transport> = match &cli.packet_log {
        Some(path) => {
            tracing::info!(path = %path.display(), "writing packets to log");
            Arc::new(PacketLogTransport::new(BufWriter::new(File::create(path)?)))
        }
        None => Arc::new(SimulatedTransport::new()),
    };

    let mut manager = ShowExecutionManager::new(&config, transport);
    if looks_like_json(&cli.show) {
        manager.load_show(&cli.show)?;
    } else {
        manager.load_show_file(&cli.show)?;
    }

    let interlock = Arc::clone(manager.interlock());
    let signals = SignalWatcher::spawn(manager.handle(), Arc::clone(&interlock));
    let outcome = run_show(cli, &config, &manager, &interlock);
    signals.stop();
    outcome
}

fn run_show(
    cli: &Cli,
    config: &AppConfig,
    manager: &ShowExecutionManager,
    interlock: &SafetyInterlock,
) -> pyro_show_core::Result<Report> {
    interlock.set_outputs_enabled(true)?;
    interlock.arm()?;

    let clock = ExecutionClock::new(&config.timing);
    let aborted = || interlock.is_aborted();
    if let Some(start) = cli.start_unix_timestamp {
        wait_for_start(start, &clock, &aborted)?;
    }
    if let Some(reason) = interlock.abort_reason() {
        return Err(ShowError::msg(reason));
    }

    let summary = manager.execute()?;

    if summary.state == ShowState::Completed {
        tracing::info!(
            hold_ms = config.timing.hold_after_show_ms,
            "holding outputs after show"
        );
        let hold = Instant::now() + Duration::from_millis(config.timing.hold_after_show_ms);
        if let WaitOutcome::Interrupted = clock.wait_for_instant(hold, &aborted) {
            tracing::warn!("hold cut short by abort");
        }
    }
    if let Err(err) = manager.release_outputs() {
        tracing::warn!(%err, "failed to release outputs");
    }
    if !interlock.is_aborted() {
        interlock.set_outputs_enabled(false)?;
    }

    Ok(Report::from_summary(&summary))
}

/// What an external process asks of a running show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Terminate,
}

#[cfg(unix)]
fn control_for(signal: i32) -> Option<Control> {
    use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
    match signal {
        SIGUSR1 => Some(Control::Pause),
        SIGUSR2 => Some(Control::Resume),
        SIGTERM | SIGINT => Some(Control::Terminate),
        _ => None,
    }
}

fn apply_control(
    control: Control,
    handle: &ShowHandle,
    interlock: &SafetyInterlock,
) -> pyro_show_core::Result<()> {
    match control {
        Control::Pause => handle.pause(),
        Control::Resume => handle.resume(),
        // a finished show may still be holding outputs
        Control::Terminate if handle.state().is_terminal() => {
            interlock.emergency_abort("terminated by signal");
            Ok(())
        }
        Control::Terminate => handle.abort("terminated by signal"),
    }
}

/// Maps SIGUSR1, SIGUSR2 and SIGTERM/SIGINT onto pause, resume and abort.
struct SignalWatcher {
    #[cfg(unix)]
    inner: Option<(signal_hook::iterator::Handle, thread::JoinHandle<()>)>,
}

impl SignalWatcher {
    #[cfg(unix)]
    fn spawn(handle: ShowHandle, interlock: Arc<SafetyInterlock>) -> Self {
        use signal_hook::{
            consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2},
            iterator::Signals,
        };

        let mut signals = match Signals::new([SIGTERM, SIGINT, SIGUSR1, SIGUSR2]) {
            Ok(signals) => signals,
            Err(err) => {
                tracing::warn!(%err, "signal handling unavailable");
                return Self { inner: None };
            }
        };
        let control = signals.handle();
        let spawned = thread::Builder::new()
            .name("show-signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let Some(command) = control_for(signal) else {
                        continue;
                    };
                    tracing::info!(signal, ?command, "control signal received");
                    if let Err(err) = apply_control(command, &handle, &interlock) {
                        tracing::warn!(signal, %err, "control signal ignored");
                    }
                }
            });
        match spawned {
            Ok(worker) => Self {
                inner: Some((control, worker)),
            },
            Err(err) => {
                tracing::warn!(%err, "could not start signal watcher");
                Self { inner: None }
            }
        }
    }

    #[cfg(not(unix))]
    fn spawn(_handle: ShowHandle, _interlock: Arc<SafetyInterlock>) -> Self {
        Self {}
    }

    #[cfg(unix)]
    fn stop(self) {
        if let Some((control, worker)) = self.inner {
            control.close();
            if worker.join().is_err() {
                tracing::error!("signal watcher panicked");
            }
        }
    }

    #[cfg(not(unix))]
    fn stop(self) {}
}

/// Sleeps and then spins until the shared start instant.
fn wait_for_start(
    start: f64,
    clock: &ExecutionClock,
    cancel: &dyn Fn() -> bool,
) -> pyro_show_core::Result<()> {
    let lead = start - unix_now();
    if lead <= 0.0 {
        tracing::warn!(
            late_ms = -lead * 1000.0,
            "start time already passed, starting immediately"
        );
        return Ok(());
    }
    let lead = Duration::try_from_secs_f64(lead)
        .map_err(|err| ShowError::msg(format!("invalid start timestamp {start}: {err}")))?;

    tracing::info!(
        start_unix_timestamp = start,
        lead_secs = lead.as_secs_f64(),
        "waiting for synchronized start"
    );
    let deadline = Instant::now() + lead;
    match clock.wait_for_instant(deadline, cancel) {
        WaitOutcome::Reached { error_ms } => {
            tracing::info!(
                error_ms,
                wall_error_ms = (unix_now() - start) * 1000.0,
                "synchronized start reached"
            );
            Ok(())
        }
        WaitOutcome::Interrupted => Err(ShowError::msg("aborted before the synchronized start")),
    }
}

fn looks_like_json(show: &str) -> bool {
    matches!(show.trim_start().chars().next(), Some('[' | '{'))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Success,
    Error,
}

/// The single JSON line printed on stdout.
#[derive(Debug, Serialize)]
struct Report {
    status: Status,
    message: String,
    /// Seconds of show time, pauses excluded.
    duration: f64,
    timing_stats: TimingStats,
}

impl Report {
    fn from_summary(summary: &ExecutionSummary) -> Self {
        let (status, message) = match summary.state {
            ShowState::Completed => (
                Status::Success,
                format!(
                    "show completed: {}/{} cues executed",
                    summary.successful_cues, summary.total_cues
                ),
            ),
            _ => (
                Status::Error,
                summary
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| format!("show ended in state {}", summary.state)),
            ),
        };
        Self {
            status,
            message,
            duration: summary.duration_ms / 1000.0,
            timing_stats: summary.timing.clone(),
        }
    }

    fn failure(message: String) -> Self {
        Self {
            status: Status::Error,
            message,
            duration: 0.0,
            timing_stats: TimingStats::default(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Execute a pyrotechnic show with precise timing", long_about = None)]
struct Cli {
    /// Show as a JSON document or a path to a JSON file.
    show: String,
    /// Unix time to start at, for synchronizing with other processes.
    start_unix_timestamp: Option<f64>,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Write every dispatched packet as JSON lines to this file.
    #[arg(long)]
    packet_log: Option<PathBuf>,
}
