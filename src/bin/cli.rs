//! modsbus CLI - Command-line interface
//!
//! Runs simulated buses, decodes frames and manages the config file.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use modsbus_core::cli::{init_logging, print_exit_codes, CliResult, ExitCodes};
use modsbus_core::core::message::{decode_frame, Envelope, ENVELOPE_SIZE};
use modsbus_core::core::protocol::control::TYPE_SET_DEVICE_ID;
use modsbus_core::{
    Bus, BusConfig, BusStats, ChannelTransport, FrameSink, InterfaceInfo, InterfaceState, Message,
    ModuleProfile, OperationStatus, ReplyRule, SimulatedModule,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// First interface id handed to simulated modules
const FIRST_MODULE_INTERFACE: u8 = 2;

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// modsbus CLI
#[derive(Parser, Debug)]
#[command(
    name = "modsbus",
    version,
    about = "Module bus control plane tools",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring up a bus with simulated modules, report, then detach
    Simulate {
        /// Number of modules
        #[arg(short, long, default_value = "2")]
        modules: u8,

        /// Require and grant authorization for every module
        #[arg(long)]
        authorize: bool,

        /// Add a module that fails SET_DEVICE_ID
        #[arg(long)]
        faulty: bool,

        /// Reply latency in ms
        #[arg(long, default_value = "0")]
        latency: u64,

        /// Random jitter on top of the latency, in ms
        #[arg(long, default_value = "0")]
        jitter: u64,
    },

    /// Decode a hex frame
    Decode {
        /// Hex bytes (spaces allowed)
        data: String,

        /// Input is a bare message without the transport envelope
        #[arg(long)]
        no_envelope: bool,
    },

    /// Config file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective config
    Show,
    /// Write the default config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match (load_config(&cli), &cli.command) {
        (Ok(config), _) => config,
        // A broken file must not block writing a fresh one
        (Err(_), Commands::Config { action: ConfigAction::Init { .. } }) => BusConfig::default(),
        (Err(e), _) => return report(CliResult::from(e)),
    };

    let _guard = match init_logging(&config.logging, cli.verbose, cli.quiet) {
        Ok(guard) => guard,
        Err(e) => return report(CliResult::from(e)),
    };

    let result = match &cli.command {
        Commands::Simulate { modules, authorize, faulty, latency, jitter } => {
            simulate(&cli, config, *modules, *authorize, *faulty, *latency, *jitter).await
        }
        Commands::Decode { data, no_envelope } => decode(&cli, data, *no_envelope),
        Commands::Config { action } => handle_config(&cli, &config, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    };

    report(result.unwrap_or_else(CliResult::from))
}

fn report(result: CliResult) -> ExitCode {
    match &result {
        CliResult::Success(Some(msg)) => println!("{}", msg),
        CliResult::Error(_, msg) => eprintln!("error: {}", msg),
        CliResult::Success(None) => {}
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> anyhow::Result<BusConfig> {
    match &cli.config {
        Some(path) => BusConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(BusConfig::load()?),
    }
}

#[derive(Debug, Serialize)]
struct AttachOutcome {
    intf: u8,
    module: String,
    result: String,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    outcomes: Vec<AttachOutcome>,
    interfaces: Vec<InterfaceInfo>,
    stats: BusStats,
}

async fn simulate(
    cli: &Cli,
    mut config: BusConfig,
    modules: u8,
    authorize: bool,
    faulty: bool,
    latency: u64,
    jitter: u64,
) -> anyhow::Result<CliResult> {
    if authorize {
        config.require_authorization = true;
    }
    let total = usize::from(modules) + usize::from(faulty);
    if total == 0 {
        return Ok(CliResult::error(ExitCodes::INVALID_ARGS, "nothing to simulate"));
    }
    if usize::from(FIRST_MODULE_INTERFACE) + total > usize::from(u8::MAX) {
        return Ok(CliResult::error(ExitCodes::INVALID_ARGS, "too many modules"));
    }

    let bus = Bus::new(config)?;
    bus.start().await.context("starting bus")?;

    let mut pending = Vec::with_capacity(total);
    for n in 0..total {
        let intf = FIRST_MODULE_INTERFACE + n as u8;
        let is_faulty = faulty && n + 1 == total;

        let name = if is_faulty { format!("faulty{}", n) } else { format!("module{}", n) };
        let mut profile = ModuleProfile::new(&name, 0x1000 + n as u32, 0x2000 + n as u32).latency(latency, jitter);
        if is_faulty {
            profile = profile.rule(
                TYPE_SET_DEVICE_ID,
                ReplyRule::Fail { status: OperationStatus::Malfunction.as_u8() },
            );
        }

        let (transport, frames) = ChannelTransport::new(name.clone());
        let sink: Arc<dyn FrameSink> = bus.clone();
        SimulatedModule::new(profile).spawn(intf, frames, sink);
        pending.push((intf, name, is_faulty, bus.interface_attached(intf, Arc::new(transport))?));
    }

    let mut outcomes = Vec::with_capacity(total);
    let mut unexpected = 0;
    for (intf, module, is_faulty, done) in pending {
        let mut result = done.await.context("attach job dropped")?;
        if result.is_ok() && authorize {
            result = bus.authorize(intf).await.context("authorize job dropped")?;
        }

        if result.is_err() != is_faulty {
            unexpected += 1;
        }
        outcomes.push(AttachOutcome {
            intf,
            module,
            result: match result {
                Ok(()) => "active".to_string(),
                Err(e) => e.to_string(),
            },
        });
    }

    let report = SimulationReport {
        outcomes,
        interfaces: bus.interfaces(),
        stats: bus.stats(),
    };
    print_report(cli, &report)?;
    bus.shutdown().await;

    if unexpected > 0 {
        return Ok(CliResult::error(
            ExitCodes::ATTACH_FAILED,
            format!("{} module(s) did not reach the expected state", unexpected),
        ));
    }
    Ok(CliResult::success())
}

fn print_report(cli: &Cli, report: &SimulationReport) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!("{:<6} {:<12} {}", "intf", "module", "result");
            println!("{:-<48}", "");
            for outcome in &report.outcomes {
                println!("{:<6} {:<12} {}", outcome.intf, outcome.module, outcome.result);
            }
            println!();
            for info in &report.interfaces {
                let device = info.device_id.map_or_else(|| "-".to_string(), |id| id.to_string());
                let marker = if info.state == InterfaceState::Active && !info.authorized { " (unauthorized)" } else { "" };
                println!("interface {:>3}: {:<20} device {}{}", info.id, info.state.to_string(), device, marker);
            }
            println!();
            let stats = &report.stats;
            println!(
                "frames forwarded {}, dropped {}, send errors {}, svc timeouts {}",
                stats.fabric.forwarded, stats.fabric.dropped, stats.fabric.send_errors, stats.svc.timeouts
            );
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DecodedFrame {
    envelope: Option<DecodedEnvelope>,
    size: u16,
    operation_id: u16,
    message_type: u8,
    response: bool,
    status: Option<String>,
    payload: String,
}

#[derive(Debug, Serialize)]
struct DecodedEnvelope {
    size: u16,
    dest_cport: u16,
    src_cport: u16,
}

impl From<&Envelope> for DecodedEnvelope {
    fn from(env: &Envelope) -> Self {
        Self { size: env.size, dest_cport: env.dest_cport, src_cport: env.src_cport }
    }
}

fn decode(cli: &Cli, data: &str, no_envelope: bool) -> anyhow::Result<CliResult> {
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = hex::decode(compact).context("parsing hex input")?;

    let (envelope, body) = if no_envelope {
        (None, bytes::Bytes::from(raw))
    } else {
        if raw.len() < ENVELOPE_SIZE {
            anyhow::bail!(modsbus_core::BusError::InvalidMessage(format!(
                "{} bytes is shorter than an envelope",
                raw.len()
            )));
        }
        let (env, body) = decode_frame(&raw).context("decoding envelope")?;
        (Some(env), body)
    };
    let message = Message::decode(&body).context("decoding message")?;

    let header = message.header();
    let decoded = DecodedFrame {
        envelope: envelope.as_ref().map(DecodedEnvelope::from),
        size: header.size,
        operation_id: header.operation_id,
        message_type: message.request_type(),
        response: message.is_response(),
        status: message.is_response().then(|| message.status().to_string()),
        payload: hex::encode(message.payload()),
    };

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&decoded)?),
        OutputFormat::Text => {
            if let Some(env) = &decoded.envelope {
                println!("envelope: size {} dest cport {} src cport {}", env.size, env.dest_cport, env.src_cport);
            }
            println!(
                "{} type 0x{:02x} op {} size {}",
                if decoded.response { "response" } else { "request" },
                decoded.message_type,
                decoded.operation_id,
                decoded.size
            );
            if let Some(status) = &decoded.status {
                println!("status: {}", status);
            }
            if !decoded.payload.is_empty() {
                println!("payload: {}", decoded.payload);
            }
        }
    }
    Ok(CliResult::success())
}

fn handle_config(cli: &Cli, config: &BusConfig, action: &ConfigAction) -> anyhow::Result<CliResult> {
    match action {
        ConfigAction::Show => {
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                OutputFormat::Text => print!("{}", config.to_toml()?),
            }
            Ok(CliResult::success())
        }
        ConfigAction::Init { force } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => BusConfig::default_path()?,
            };
            if path.exists() && !force {
                return Ok(CliResult::error(
                    ExitCodes::CONFIG_ERROR,
                    format!("{} exists, use --force to overwrite", path.display()),
                ));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            BusConfig::default().save_to(&path)?;
            Ok(CliResult::success_with_message(format!("wrote {}", path.display())))
        }
        ConfigAction::Path => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => BusConfig::default_path()?,
            };
            Ok(CliResult::success_with_message(path.display().to_string()))
        }
    }
}
