//! Program lifecycle.
//!
//! ```text
//! args -> Settings/SessionConfig -> connect -> install sink -> flow.start
//!                                                                 |
//!        stdin watcher ----\                                      v
//!        Ctrl+C watcher ----+--> Shutdown <-- sinks     RunLoop (1 line/s)
//!                                    |                            |
//!                                    \------------> close session, "Main thread quitting."
//! ```

use std::ffi::OsString;
use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{connect_session, FlowProperties, Result, Session};
use crate::cli::{parse_args, ArgsError};
use crate::config::{SessionConfig, Settings};
use crate::pipeline::{PipelineKind, SessionEvents};
use crate::utils::bootstrap::init_tracing;

pub mod counters;
pub mod report;
pub mod shutdown;

pub use counters::{Counters, Sample};
pub use report::{Program, Shape, QUITTING};
pub use shutdown::{Shutdown, StopReason};

fn emit<W: Write>(out: &mut W, line: &str) {
    if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
        warn!(error = %e, "Failed to write console line");
    }
}

/// Print `--help`/`--version` output; a failed write is a failed run.
fn print_info<W: Write>(out: &mut W, info: &clap::Error) -> ExitCode {
    match write!(out, "{}", info.render()).and_then(|_| out.flush()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!(error = %e, "Failed to print help");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Run loop
// ============================================================================

/// Prints one status line per interval until the shutdown flag is set.
pub struct RunLoop {
    program: Program,
    counters: Arc<Counters>,
    shutdown: Shutdown,
    interval: Duration,
}

impl RunLoop {
    pub fn new(
        program: Program,
        counters: Arc<Counters>,
        shutdown: Shutdown,
        interval: Duration,
    ) -> Self {
        Self {
            program,
            counters,
            shutdown,
            interval,
        }
    }

    /// Run until stopped, returning the first stop reason.
    pub async fn run<W: Write + Send>(&self, out: &mut W) -> StopReason {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                reason = self.shutdown.triggered() => return reason,
                _ = ticker.tick() => self.tick(out),
            }
        }
    }

    fn tick<W: Write>(&self, out: &mut W) {
        let sample = self.counters.take();
        emit(out, &self.program.status_line(&sample));
        if sample.discard_detected {
            emit(out, &self.program.discard_warning());
        }
    }
}

// ============================================================================
// Stop sources
// ============================================================================

/// Watch `input` on a dedicated thread; the first read that returns data sets
/// the shutdown flag. End of input is ignored.
///
/// The thread blocks in `read` for the life of the process; it is never joined.
pub fn watch_input<R>(
    mut input: R,
    shutdown: Shutdown,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("stdin-watcher".to_string())
        .spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                match input.read(&mut buf) {
                    Ok(0) => {
                        debug!("Standard input closed; ignoring");
                        return;
                    }
                    Ok(_) => {
                        shutdown.trigger(StopReason::OperatorInput);
                        return;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "Standard input unreadable; operator stop disabled");
                        return;
                    }
                }
            }
        })
}

/// Treat Ctrl+C as an external stop.
pub fn watch_interrupt(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    shutdown.trigger(StopReason::Interrupted);
                }
                Err(e) => warn!(error = %e, "Unable to listen for Ctrl+C"),
            },
            _ = shutdown.triggered() => {}
        }
    })
}

// ============================================================================
// Relay
// ============================================================================

/// One program: a queue, the sink installed on it, and the report it prints.
pub struct Relay {
    program: Program,
    queue: String,
    kind: PipelineKind,
    counters: Arc<Counters>,
    shutdown: Shutdown,
    interval: Duration,
}

impl Relay {
    pub fn new(
        program: Program,
        queue: impl Into<String>,
        kind: PipelineKind,
        shutdown: Shutdown,
        interval: Duration,
    ) -> Self {
        Self {
            program,
            queue: queue.into(),
            kind,
            counters: Arc::new(Counters::new()),
            shutdown,
            interval,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Bind the flow, report until stopped, then close the session.
    ///
    /// The session is closed and the final line printed on every path,
    /// including a failure to bind the flow.
    pub async fn run<W: Write + Send>(
        &self,
        session: Arc<dyn Session>,
        out: &mut W,
    ) -> Result<StopReason> {
        let outcome = self.serve(session.as_ref(), out).await;

        self.shutdown.trigger(StopReason::Exiting);
        if let Err(e) = session.close().await {
            error!(error = %e, "Failed to close session");
        }
        emit(out, QUITTING);

        outcome
    }

    async fn serve<W: Write + Send>(
        &self,
        session: &dyn Session,
        out: &mut W,
    ) -> Result<StopReason> {
        let handler = self
            .kind
            .install(session, self.counters.clone(), self.shutdown.clone())
            .await?;

        let flow = session
            .create_flow(FlowProperties::exclusive(&self.queue), handler)
            .await?;
        flow.start().await?;
        info!(queue = %self.queue, program = %self.program.name, "Flow started");

        emit(out, &self.program.running());

        let run_loop = RunLoop::new(
            self.program,
            self.counters.clone(),
            self.shutdown.clone(),
            self.interval,
        );
        Ok(run_loop.run(out).await)
    }
}

/// Entry point shared by both binaries.
pub async fn run_program<I, T>(
    program: Program,
    queue: &str,
    kind: PipelineKind,
    argv: I,
) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut out = std::io::stdout();

    let args = match parse_args(argv) {
        Ok(args) => args,
        Err(ArgsError::Usage) => {
            emit(&mut out, &program.usage());
            return ExitCode::FAILURE;
        }
        Err(ArgsError::Info(e)) => {
            return print_info(&mut out, &e);
        }
    };

    init_tracing();

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid settings");
            return ExitCode::FAILURE;
        }
    };

    let config = match SessionConfig::new(
        &args.host,
        args.vpn,
        args.username,
        args.password,
        &settings,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid connection parameters");
            emit(&mut out, &program.usage());
            return ExitCode::FAILURE;
        }
    };

    emit(&mut out, &program.initializing());

    let shutdown = Shutdown::new();
    let session = match connect_session(&config, Arc::new(SessionEvents::new(shutdown.clone())))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, hosts = ?config.hosts, "Unable to connect");
            emit(&mut out, QUITTING);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = watch_input(std::io::stdin(), shutdown.clone()) {
        warn!(error = %e, "Unable to watch standard input");
    }
    let interrupt = watch_interrupt(shutdown.clone());

    let relay = Relay::new(program, queue, kind, shutdown, settings.report_interval());
    let outcome = relay.run(session, &mut out).await;
    interrupt.abort();

    match outcome {
        Ok(reason) => {
            info!(reason = ?reason, "Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, queue = %queue, "Unable to bind flow");
            ExitCode::FAILURE
        }
    }
}
