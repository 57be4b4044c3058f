//! serialcal - configure and converse with serial-attached devices
//!
//! Runs one of four modes against the device: interactive relay, a single
//! question, the calibration script, or an XMODEM transfer. The console is
//! the terminal unless `--console` names a file, socket or TCP endpoint.

use anyhow::Context;
use clap::Parser;
use serialcal_core::cli::{CliResult, OutputFormat};
use serialcal_core::config::{self, AppConfig};
use serialcal_core::core::calibrate::CalibrationOptions;
use serialcal_core::core::context::{FlowControl, LineTerminator, RuntimeContext, Verbosity};
use serialcal_core::core::multiplexer::{listen_and_serve, resolve, ConsoleSpec};
use serialcal_core::core::relay::{RelayExit, RelayOptions};
use serialcal_core::core::runner::{run_session, Mode, SessionOutcome, SessionPlan};
use serialcal_core::core::transfer::TransferDirection;
use serialcal_core::core::transport::{list_ports, BufferedTransport, ByteTransport, SerialSettings};
use serialcal_core::utils::{init_tracing, RawModeGuard};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// serialcal CLI
#[derive(Parser, Debug)]
#[command(
    name = "serialcal",
    author,
    version,
    about = "Configure and converse with microcontroller devices over a serial port",
    long_about = None
)]
struct Cli {
    /// Serial device (defaults to the configured device)
    device: Option<String>,

    /// Line settings as BAUD[,parity[,bits[,stop]]]
    settings: Option<String>,

    /// Interactive relay between the console and the device
    #[arg(short, long, conflicts_with_all = ["question", "transfer"])]
    raw: bool,

    /// Send one question and print the reply
    #[arg(short, long, value_name = "TEXT", conflicts_with = "transfer")]
    question: Option<String>,

    /// Transfer a file: S sends to the device, R receives from it
    #[arg(short = 'X', long, num_args = 2, value_names = ["S|R", "FILE"])]
    transfer: Option<Vec<String>>,

    /// Line terminator sent after commands
    #[arg(short = 'm', long, value_name = "cr|lf|crlf", value_parser = parse_terminator)]
    terminator: Option<LineTerminator>,

    /// Echo console keystrokes locally in relay mode
    #[arg(short = 'e', long)]
    local_echo: bool,

    /// Do not reset the device before starting
    #[arg(short = 'N', long)]
    no_reset: bool,

    /// Raise DTR/RTS for the whole session
    #[arg(short = 'F', long)]
    flow_control: bool,

    /// Seconds to wait for the device after a reset
    #[arg(short = 'W', long, value_name = "SECS")]
    reset_wait: Option<u64>,

    /// Quiet period that ends a question reply (ms)
    #[arg(short = 'w', long, value_name = "MS")]
    wait: Option<u64>,

    /// Alternate console: HOST:PORT, :PORT, or a file/socket path
    #[arg(short = 'c', long, value_name = "SPEC")]
    console: Option<String>,

    /// Listen on the --console address and serve one connection at a time
    #[arg(short = 'l', long, requires = "console")]
    listen: bool,

    /// Include the factory reset step in calibration
    #[arg(short = 'R', long)]
    factory_reset: bool,

    /// Suppress operator messages
    #[arg(short = 'Q', long)]
    quiet: bool,

    /// Increase diagnostic output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for question replies and port listings
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also write diagnostics to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn parse_terminator(s: &str) -> Result<LineTerminator, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let result = CliResult::from_error(&e);
            if let Some(msg) = result.message() {
                eprintln!("Error: {msg}");
            }
            result.to_exit_code()
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load(cli.config.as_deref())?;

    let verbosity = Verbosity::new(config.logging.verbosity.level().saturating_add(cli.verbose));
    let log_file = cli.log_file.as_deref().or(config.logging.file.as_deref());
    let _log_guard = init_tracing(verbosity, log_file)?;

    if cli.list_ports {
        return print_ports(cli.format);
    }

    let ctx = build_context(&cli, &config, verbosity);
    let quit = ctx.quit_token().clone();
    ctrlc::set_handler(move || quit.cancel()).context("Unable to install signal handler")?;

    let plan = build_plan(&cli, &config)?;
    info!(device = %plan.device, settings = %plan.settings, "starting");

    let outcome = match cli.console.as_deref() {
        Some(spec) if cli.listen => {
            let spec = ConsoleSpec::parse(spec)?;
            let plan = Arc::new(plan);
            let served = listen_and_serve(&spec, &ctx, move |mut console, session_ctx| {
                let plan = Arc::clone(&plan);
                async move {
                    run_session(console.as_mut(), &plan, &session_ctx)
                        .await
                        .map(|outcome| debug!(?outcome, "session outcome"))
                }
            })
            .await?;
            info!(served, "listener stopped");
            return Ok(());
        }
        Some(spec) => {
            let spec = ConsoleSpec::parse(spec)?;
            let mut console = resolve(&spec).await?;
            run_session(console.as_mut(), &plan, &ctx).await?
        }
        None => {
            let _raw = if matches!(plan.mode, Mode::Relay(_) | Mode::Calibrate { .. }) {
                RawModeGuard::enable_stdin().context("Unable to configure console")?
            } else {
                None
            };
            let mut console = BufferedTransport::stdio()?;
            run_session(&mut console, &plan, &ctx).await?
        }
    };

    report(&outcome);
    Ok(())
}

fn build_context(cli: &Cli, config: &AppConfig, verbosity: Verbosity) -> RuntimeContext {
    let terminator = cli.terminator.unwrap_or(config.protocol.terminator);
    let flow_control = if cli.flow_control || config.reset.flow_control {
        FlowControl::Lines
    } else {
        FlowControl::None
    };
    RuntimeContext::new(verbosity, terminator)
        .with_flow_control(flow_control)
        .with_quiet(cli.quiet)
}

fn build_plan(cli: &Cli, config: &AppConfig) -> anyhow::Result<SessionPlan> {
    let device = cli.device.clone().unwrap_or_else(|| config.device.path.clone());
    let settings: SerialSettings = cli
        .settings
        .as_deref()
        .unwrap_or(&config.device.settings)
        .parse()?;

    let mode = if cli.raw {
        Mode::Relay(RelayOptions {
            pass_through: false,
            local_echo: cli.local_echo,
        })
    } else if let Some(text) = &cli.question {
        Mode::Question {
            text: text.clone(),
            wait: Duration::from_millis(cli.wait.unwrap_or(config.protocol.question_wait_ms)),
            format: cli.format,
        }
    } else if let Some(args) = &cli.transfer {
        let [direction, file] = args.as_slice() else {
            anyhow::bail!("--transfer needs a direction and a file");
        };
        let direction: TransferDirection = direction.parse().map_err(anyhow::Error::msg)?;
        Mode::Transfer {
            direction,
            file: PathBuf::from(file),
        }
    } else {
        Mode::Calibrate {
            script: config.calibration.script(),
            options: CalibrationOptions {
                factory_reset: cli.factory_reset,
                reply_timeout: Duration::from_millis(config.protocol.reply_timeout_ms),
                repeat_interval: Duration::from_millis(config.protocol.repeat_interval_ms),
                reply_cap: config.protocol.reply_cap,
                echo_input: true,
            },
        }
    };

    Ok(SessionPlan {
        device,
        settings,
        reset: config.reset.enabled && !cli.no_reset,
        boot_wait_secs: cli.reset_wait.unwrap_or(config.reset.wait_secs),
        alternate_console: cli.console.is_some(),
        mode,
    })
}

fn print_ports(format: OutputFormat) -> anyhow::Result<()> {
    let ports = list_ports()?;

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.name,
                        "type": p.description,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text | OutputFormat::Hex => {
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in &ports {
                println!("{:<24} {}", port.name, port.description);
            }
        }
    }

    Ok(())
}

fn report(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Relay(RelayExit::DeviceClosed) => warn!("device closed the connection"),
        SessionOutcome::Relay(exit) => debug!(?exit, "relay stopped"),
        SessionOutcome::Answered(reply) => debug!(bytes = reply.len(), "question answered"),
        SessionOutcome::Calibration(outcome) => info!(?outcome, "calibration finished"),
        SessionOutcome::Transferred(bytes) => info!(bytes, "transfer finished"),
    }
}
