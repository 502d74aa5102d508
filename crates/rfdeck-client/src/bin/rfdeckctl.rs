use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rfdeck_client::{ClientConfig, DaemonClient, DEFAULT_SOCKET_PATH};
use rfdeck_ipc::{DaemonEvent, SweepConfig, DEFAULT_BIN_WIDTH_HZ, DEFAULT_SPAN_HZ};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "rfdeckctl", author, version, about = "Operator CLI for rfdeckd")]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, env = "RFDECKD_SOCKET", default_value = DEFAULT_SOCKET_PATH, global = true)]
    socket: PathBuf,

    /// Output format for command responses
    #[arg(long = "output", value_enum, default_value_t = OutputFormat::Text, global = true)]
    output_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Health,
    Version,
    #[command(subcommand)]
    Device(DeviceCommand),
    #[command(subcommand)]
    Sweep(SweepCommand),
    #[command(subcommand)]
    Tool(ToolCommand),
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Owner and availability of every device
    Status,
    Acquire(DeviceOwnerArgs),
    Release(DeviceOwnerArgs),
    /// Clear a lease regardless of owner
    ForceRelease {
        device: String,
    },
}

#[derive(Args, Debug)]
struct DeviceOwnerArgs {
    device: String,
    #[arg(long)]
    owner: String,
    /// PID of the process that uses the device
    #[arg(long)]
    pid: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum SweepCommand {
    Start(SweepStartArgs),
    Stop,
    /// Kill the capture immediately and free the HackRF
    EmergencyStop,
    ForceCleanup,
    Status,
    ProcessInfo,
    Health,
    /// Print spectrum frames and status changes as they arrive
    Watch {
        /// Exit after this many spectrum frames
        #[arg(long)]
        count: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct SweepStartArgs {
    /// Centre frequency in Hz
    #[arg(long)]
    center: u64,
    #[arg(long, default_value_t = DEFAULT_SPAN_HZ)]
    span: u64,
    /// VGA gain in dB
    #[arg(long)]
    gain: Option<u32>,
    #[arg(long)]
    lna_gain: Option<u32>,
    #[arg(long, default_value_t = DEFAULT_BIN_WIDTH_HZ)]
    bin_width: u32,
}

#[derive(Subcommand, Debug)]
enum ToolCommand {
    List,
    Start {
        name: String,
        /// Extra argument appended to the tool's command line (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    Stop {
        name: String,
    },
    Status {
        name: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let format = cli.output_format;
    if let Err(err) = run(cli).await {
        emit_error(format, &err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig {
        socket_path: cli.socket.clone(),
        client_name: "rfdeckctl".to_string(),
        ..Default::default()
    };
    let mut client = DaemonClient::connect_with_config(config).await?;
    let format = cli.output_format;

    let (message, data) = match cli.command {
        Commands::Health => ("daemon healthy".to_string(), to_value(client.health().await?)?),
        Commands::Version => ("daemon version".to_string(), to_value(client.version().await?)?),
        Commands::Device(cmd) => match cmd {
            DeviceCommand::Status => (
                "device status".to_string(),
                to_value(client.device_status().await?)?,
            ),
            DeviceCommand::Acquire(args) => {
                let lease = client
                    .device_acquire(&args.device, &args.owner, args.pid)
                    .await?;
                (format!("{} acquired by {}", args.device, args.owner), to_value(lease)?)
            }
            DeviceCommand::Release(args) => {
                let released = client.device_release(&args.device, &args.owner).await?;
                (
                    format!("{} release", args.device),
                    json!({ "released": released }),
                )
            }
            DeviceCommand::ForceRelease { device } => {
                let released = client.device_force_release(&device).await?;
                (format!("{device} force release"), json!({ "released": released }))
            }
        },
        Commands::Sweep(cmd) => match cmd {
            SweepCommand::Start(args) => {
                let config = SweepConfig {
                    center_freq_hz: args.center,
                    span_hz: args.span,
                    gain: args.gain,
                    lna_gain: args.lna_gain,
                    bin_width_hz: args.bin_width,
                };
                let status = client.sweep_start(config).await?;
                (format!("sweep {}", status.state), to_value(status)?)
            }
            SweepCommand::Stop => {
                let status = client.sweep_stop().await?;
                (format!("sweep {}", status.state), to_value(status)?)
            }
            SweepCommand::EmergencyStop => {
                let status = client.sweep_emergency_stop().await?;
                (format!("sweep {}", status.state), to_value(status)?)
            }
            SweepCommand::ForceCleanup => {
                let status = client.sweep_force_cleanup().await?;
                (format!("sweep {}", status.state), to_value(status)?)
            }
            SweepCommand::Status => {
                let status = client.sweep_status().await?;
                (format!("sweep {}", status.state), to_value(status)?)
            }
            SweepCommand::ProcessInfo => (
                "sweep process".to_string(),
                to_value(client.sweep_process_info().await?)?,
            ),
            SweepCommand::Health => {
                let health = client.sweep_health().await?;
                let message = if health.connected {
                    "hackrf connected".to_string()
                } else {
                    format!(
                        "hackrf not available: {}",
                        health.error.as_deref().unwrap_or("unknown")
                    )
                };
                (message, to_value(health)?)
            }
            SweepCommand::Watch { count } => return watch(client, format, count).await,
        },
        Commands::Tool(cmd) => match cmd {
            ToolCommand::List => ("tools".to_string(), to_value(client.tool_list().await?)?),
            ToolCommand::Start { name, args } => {
                let status = client.tool_start(&name, json!({ "args": args })).await?;
                (format!("{name} started"), to_value(status)?)
            }
            ToolCommand::Stop { name } => {
                let status = client.tool_stop(&name).await?;
                (format!("{name} stopped"), to_value(status)?)
            }
            ToolCommand::Status { name } => {
                let status = client.tool_status(&name).await?;
                (format!("{name} status"), to_value(status)?)
            }
        },
    };

    emit_payload(format, "ok", message, data)
}

async fn watch(client: DaemonClient, format: OutputFormat, count: Option<u64>) -> Result<()> {
    let (ack, mut events) = client.subscribe().await?;
    emit_payload(
        format,
        "ok",
        format!("subscribed, sweep {}", ack.status.state),
        to_value(&ack.status)?,
    )?;

    let mut frames = 0u64;
    while let Some(event) = events.next().await? {
        match (&event, format) {
            (_, OutputFormat::Json) => println!("{}", serde_json::to_string(&event)?),
            (DaemonEvent::Spectrum(sample), OutputFormat::Text) => println!(
                "{} {:.3} MHz bins={} peak={:.1} dBm",
                sample.timestamp.format("%H:%M:%S%.3f"),
                sample.center_freq_hz() as f64 / 1e6,
                sample.power_bins.len(),
                sample.peak_dbm().unwrap_or(f32::NAN),
            ),
            (DaemonEvent::SweepStatus(status), OutputFormat::Text) => {
                let error = status.last_error.as_deref().unwrap_or("");
                println!("state {} {}", status.state, error);
            }
            (DaemonEvent::SubscriberLagged { dropped }, OutputFormat::Text) => {
                println!("lagged, {dropped} events dropped");
            }
        }
        if matches!(event, DaemonEvent::Spectrum(_)) {
            frames += 1;
            if count.is_some_and(|limit| frames >= limit) {
                break;
            }
        }
    }
    Ok(())
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).context("serializing response")
}

fn emit_error(format: OutputFormat, err: &anyhow::Error) {
    let details: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
    let payload = json!({
        "status": "error",
        "message": err.to_string(),
        "details": details,
        "data": Value::Null,
    });

    match format {
        OutputFormat::Json => println!("{}", payload),
        OutputFormat::Text => {
            eprintln!("Error: {}", err);
            for detail in details.iter().skip(1) {
                eprintln!("  -> {}", detail);
            }
        }
    }
}

fn emit_payload(format: OutputFormat, status: &str, message: String, data: Value) -> Result<()> {
    let payload = json!({
        "status": status,
        "message": message,
        "data": data,
    });

    match format {
        OutputFormat::Json => println!("{}", payload),
        OutputFormat::Text => {
            println!("{}", payload["message"].as_str().unwrap_or_default());
            if !payload["data"].is_null() {
                let pretty = serde_json::to_string_pretty(&payload["data"])?;
                println!("{pretty}");
            }
        }
    }
    Ok(())
}
