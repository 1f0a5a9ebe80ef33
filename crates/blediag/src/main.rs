use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use blecan::command::{CanFilterConfig, FlowControlConfig};
use blecan::presets;
use blecan::session::{AckMode, FrameStatus, Session, Transport};
use blecan::sim::SimAdapter;
use blecan::uds;
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::transport::{TransportKind, ble};

mod config;
mod transport;

type CmdResult<T = ()> = Result<T>;

#[derive(Parser)]
#[command(
    name = "blediag",
    about = "UDS diagnostics through a BLE-CAN OBD adapter",
    long_about = "Configures a BLE-CAN adapter (CAN filter and ISO-TP flow control) and exchanges UDS requests with the ECU behind it. Every frame is retried with a growing backoff until the adapter acknowledges it.",
    subcommand_required = true,
    arg_required_else_help = true,
    after_help = "Examples:\n  blediag scan\n  blediag --address AA:BB:CC:DD:EE:FF read\n  blediag send 3E00 22F190\n  blediag --transport sim segmented 00112233445566778899AABBCCDDEEFF0011\n  BLEDIAG_LOG=blecan=trace blediag preset"
)]
struct Cli {
    /// TOML file with device, session and CAN settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Adapter address or platform id (overrides the config file)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Advertised adapter name (overrides the config file)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// GATT characteristic frames are written to
    #[arg(long, global = true)]
    write_uuid: Option<Uuid>,

    /// GATT characteristic the adapter notifies on
    #[arg(long, global = true)]
    notify_uuid: Option<Uuid>,

    /// Write without response
    #[arg(long, global = true)]
    no_response: bool,

    #[arg(short, long, value_enum, default_value = "ble", global = true)]
    transport: TransportKind,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE devices and mark likely OBD adapters
    Scan {
        /// Scan duration in seconds
        #[arg(long)]
        secs: Option<u64>,
    },
    /// Apply CAN filter and flow control settings
    Configure,
    /// Configure, then run tester present, extended session, identification reads and a routine
    Read {
        /// Assume the adapter is already configured
        #[arg(long)]
        skip_configure: bool,
    },
    /// Send the canned identification and DTC request frames
    Preset,
    /// Send UDS payloads given as hex strings
    Send {
        #[arg(required = true, value_parser = parse_hex)]
        payloads: Vec<HexBytes>,

        /// Configure the adapter first
        #[arg(long)]
        configure: bool,
    },
    /// Send a blob as indexed segments, each confirmed by the adapter
    Segmented {
        /// Blob as a hex string
        #[arg(value_parser = parse_hex, required_unless_present = "file")]
        data: Option<HexBytes>,

        /// Read the blob from a file
        #[arg(long, conflicts_with = "data")]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
struct HexBytes(Vec<u8>);

fn parse_hex(s: &str) -> Result<HexBytes, String> {
    let clean: String = s.chars().filter(|c| !matches!(c, ' ' | ':' | '-')).collect();
    let clean = clean
        .strip_prefix("0x")
        .or_else(|| clean.strip_prefix("0X"))
        .unwrap_or(&clean);
    hex::decode(clean)
        .map(HexBytes)
        .map_err(|e| format!("invalid hex '{}': {}", s, e))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("BLEDIAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("blediag={level},blecan={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn device_config(cli: &Cli) -> CmdResult<DeviceConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            DeviceConfig::load(path)?
        }
        None => DeviceConfig::default(),
    };
    if let Some(address) = &cli.address {
        cfg.address = Some(address.clone());
    }
    if let Some(name) = &cli.name {
        cfg.name = name.clone();
    }
    if let Some(uuid) = cli.write_uuid {
        cfg.write_uuid = uuid;
    }
    if let Some(uuid) = cli.notify_uuid {
        cfg.notify_uuid = uuid;
    }
    if cli.no_response {
        cfg.write_with_response = false;
    }
    Ok(cfg)
}

fn new_progress_bar(len: u64) -> CmdResult<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} segments ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn cmd_scan(cfg: &DeviceConfig, secs: Option<u64>) -> CmdResult {
    let found = ble::scan(secs.unwrap_or(cfg.scan_secs)).await?;
    if found.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    println!("Devices");
    for d in &found {
        let mark = if d.looks_like_adapter(cfg) { "*" } else { " " };
        let rssi = d.rssi.map(|r| format!("{} dBm", r)).unwrap_or_default();
        println!(
            "{} {:<20} {:<24} {:>8}",
            mark,
            d.address,
            d.name.as_deref().unwrap_or("-"),
            rssi
        );
    }
    println!("(* likely OBD adapter)");
    Ok(())
}

async fn cmd_configure<T: Transport>(session: &mut Session<T>, cfg: &DeviceConfig) -> CmdResult {
    let can = CanFilterConfig::from(&cfg.can);
    let flow = FlowControlConfig::from(&cfg.flow);
    session
        .configure(&can, &flow)
        .await
        .context("adapter configuration failed")?;
    println!(
        "Adapter configured: {} kbit/s, request 0x{:03X}, response 0x{:03X}",
        can.baud_rate_kbps, can.diag_req_can_id, can.diag_can_id
    );
    Ok(())
}

async fn cmd_read<T: Transport>(
    session: &mut Session<T>,
    cfg: &DeviceConfig,
    skip_configure: bool,
) -> CmdResult {
    if !skip_configure {
        cmd_configure(session, cfg).await?;
    }
    let requests = presets::standard_requests();
    let responses = session.run_requests(&requests).await?;
    for ((name, _), response) in requests.iter().zip(&responses) {
        println!("{:<26} {}", name, response);
        if let uds::UdsResponse::DataRead(data) = response {
            if let Some(text) = printable(data.get(2..).unwrap_or_default()) {
                println!("{:<26} \"{}\"", "", text);
            }
        }
    }
    Ok(())
}

async fn cmd_preset<T: Transport>(session: &mut Session<T>) -> CmdResult {
    let frames = presets::diag_request_frames(session.encoder())?;
    let report = session.run_sequence(&frames, &AckMode::AnyFrame).await;
    for (outcome, frame) in report.outcomes.iter().zip(&frames) {
        match &outcome.status {
            FrameStatus::Acked { response } => {
                let text = response
                    .as_ref()
                    .map(|r| uds::interpret(r).to_string())
                    .unwrap_or_else(|| "acknowledged".to_string());
                println!("{:>2}. {}  ->  {}", outcome.index, frame, text);
            }
            FrameStatus::Failed(cause) => {
                println!("{:>2}. {}  ->  FAILED ({})", outcome.index, frame, cause);
            }
        }
    }
    let total = frames.len();
    let outcomes = report.into_result()?;
    println!("{}/{} frames acknowledged", outcomes.len(), total);
    Ok(())
}

async fn cmd_send<T: Transport>(
    session: &mut Session<T>,
    cfg: &DeviceConfig,
    payloads: Vec<HexBytes>,
    configure: bool,
) -> CmdResult {
    if configure {
        cmd_configure(session, cfg).await?;
    }
    for HexBytes(payload) in payloads {
        let response = session.request(&payload).await?;
        println!("{}  ->  {}", hex::encode_upper(&payload), response);
    }
    Ok(())
}

async fn cmd_segmented<T: Transport>(
    session: &mut Session<T>,
    data: Option<HexBytes>,
    file: Option<PathBuf>,
) -> CmdResult {
    let blob = match (data, file) {
        (Some(HexBytes(data)), _) => data,
        (None, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))?,
        (None, None) => bail!("nothing to send"),
    };
    if blob.is_empty() {
        bail!("blob is empty");
    }

    let pb = new_progress_bar(0)?;
    pb.set_message("Sending");
    let report = session
        .send_segmented(&blob, |done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
        .await?;
    let outcomes = match report.into_result() {
        Ok(outcomes) => {
            pb.finish_with_message("Sent");
            outcomes
        }
        Err(e) => {
            pb.abandon_with_message("Failed");
            return Err(e.into());
        }
    };
    let retries: u32 = outcomes.iter().map(|o| o.retries).sum();
    println!(
        "{} bytes in {} segments, {} retries",
        blob.len(),
        outcomes.len(),
        retries
    );
    Ok(())
}

fn printable(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    (!text.is_empty() && text.chars().all(|c| c.is_ascii_graphic() || c == ' '))
        .then(|| text.to_string())
}

async fn run<T: Transport>(
    session: &mut Session<T>,
    command: Commands,
    cfg: &DeviceConfig,
) -> CmdResult {
    match command {
        Commands::Scan { .. } => bail!("scan does not use a session"),
        Commands::Configure => cmd_configure(session, cfg).await,
        Commands::Read { skip_configure } => cmd_read(session, cfg, skip_configure).await,
        Commands::Preset => cmd_preset(session).await,
        Commands::Send {
            payloads,
            configure,
        } => cmd_send(session, cfg, payloads, configure).await,
        Commands::Segmented { data, file } => cmd_segmented(session, data, file).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = device_config(&cli)?;

    if let Commands::Scan { secs } = cli.command {
        return cmd_scan(&cfg, secs).await;
    }

    match cli.transport {
        TransportKind::Sim => {
            let mut session = SimAdapter::session(cfg.session_config());
            run(&mut session, cli.command, &cfg).await
        }
        TransportKind::Ble => {
            let mut session = ble::open(&cfg).await?;
            let result = run(&mut session, cli.command, &cfg).await;
            session.transport().disconnect().await;
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_arguments() {
        assert_eq!(parse_hex("22F190").unwrap().0, vec![0x22, 0xF1, 0x90]);
        assert_eq!(parse_hex("0x3E 00").unwrap().0, vec![0x3E, 0x00]);
        assert_eq!(parse_hex("10:03").unwrap().0, vec![0x10, 0x03]);
        assert!(parse_hex("3G").is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["blediag", "--transport", "sim", "send", "3E00", "22F190"])
            .unwrap();
        assert_eq!(cli.transport, TransportKind::Sim);
        let Commands::Send { payloads, configure } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(payloads.len(), 2);
        assert!(!configure);

        assert!(Cli::try_parse_from(["blediag", "segmented"]).is_err());
    }

    #[test]
    fn printable_data() {
        assert_eq!(printable(b"WVWZZZ1JZXW000001").as_deref(), Some("WVWZZZ1JZXW000001"));
        assert_eq!(printable(&[0x00, 0x2A]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn read_against_simulator() {
        let cfg = DeviceConfig::default();
        let mut session = SimAdapter::session(cfg.session_config());
        cmd_read(&mut session, &cfg, false).await.unwrap();
        cmd_segmented(&mut session, Some(HexBytes(vec![0xAB; 33])), None)
            .await
            .unwrap();
        assert_eq!(session.transport().received_blob().unwrap(), vec![0xAB; 33]);
    }
}
