use std::path::PathBuf;

use anyhow::{Context, bail};
use btota_core::protocol::{FEATURE_UNIT_DATA_CRC, crc32};
use btota_core::session::{IoctlCommand, IoctlReply, OtaSession, SessionConfig};
use btota_core::transport::{ConnectionKind, Fault, HostSimulator, LinkEvent};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bluetooth OTA device session against a simulated host", long_about = None)]
struct Args {
    /// Firmware image served by the simulated host
    #[arg(long)]
    image: PathBuf,

    /// Link type (spp, gatt-over-br, ble, other)
    #[arg(long, default_value = "ble")]
    connect_type: ConnectionKind,

    /// Reported link MTU (only used for BLE)
    #[arg(long, default_value_t = 247)]
    mtu: u16,

    /// Host does not advertise any features (disables unit CRC)
    #[arg(long)]
    no_host_features: bool,

    /// Bytes per read request (defaults to the max request size)
    #[arg(long)]
    block_size: Option<u32>,

    /// Inject a fault: skip-psn=N, bad-crc=N or renegotiate=N
    #[arg(long, value_parser = parse_fault)]
    fault: Vec<Fault>,

    /// Load session configuration from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Save the effective session configuration to a TOML file
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Write the received image to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_fault(s: &str) -> Result<Fault, String> {
    let (kind, psn) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=PSN, got '{s}'"))?;
    let psn: u8 = psn
        .parse()
        .map_err(|e| format!("invalid psn '{psn}': {e}"))?;
    match kind {
        "skip-psn" => Ok(Fault::SkipPsn(psn)),
        "bad-crc" => Ok(Fault::CorruptCrc(psn)),
        "renegotiate" => Ok(Fault::Renegotiate(psn)),
        other => Err(format!("unknown fault '{other}'")),
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .with_context(|| format!("saving config {}", path.display()))?;
        info!(path = %path.display(), "Saved configuration");
    }

    let image = std::fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;
    let total = u32::try_from(image.len()).context("image larger than 4 GiB")?;
    info!(path = %args.image.display(), size = total, "Loaded image");

    let features = (!args.no_host_features).then_some(FEATURE_UNIT_DATA_CRC);
    let mut host = HostSimulator::new(image.clone()).with_features(features);
    for fault in &args.fault {
        host = host.with_fault(*fault);
    }

    let mut session = OtaSession::new(host.clone(), config);
    session.handle_link_event(LinkEvent::Connected {
        kind: args.connect_type,
        mtu: args.mtu,
    });
    session.open()?;

    let block = match args.block_size {
        Some(n) if n > 0 => n,
        Some(_) => bail!("block size must be non-zero"),
        None => match session.ioctl(IoctlCommand::GetMaxSize)? {
            IoctlReply::MaxSize(Some(max)) => max,
            _ => 4096,
        },
    };
    info!(block, unit_size = session.unit_size(), unit_crc = session.unit_crc(), "Starting transfer");

    let mut received = vec![0u8; image.len()];
    let mut offset = 0u32;
    let mut last_percent = 0u8;
    while offset < total {
        let len = block.min(total - offset);
        let start = offset as usize;
        let end = start + len as usize;
        session
            .read(offset, &mut received[start..end])
            .with_context(|| format!("reading 0x{:X}+{}", offset, len))?;
        offset += len;

        let percent = (u64::from(offset) * 100 / u64::from(total)) as u8;
        if percent != last_percent {
            session.ioctl(IoctlCommand::ReportProgress(percent))?;
            last_percent = percent;
        }
    }

    let expected = crc32(&image);
    let actual = crc32(&received);
    let valid = expected == actual;
    if !valid {
        warn!(
            expected = %format!("0x{:08X}", expected),
            actual = %format!("0x{:08X}", actual),
            "Image CRC mismatch"
        );
    }
    session.ioctl(IoctlCommand::ReportImageValid(valid))?;

    if let Some(path) = &args.output {
        std::fs::write(path, &received)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Wrote received image");
    }

    println!("Connection : {}", session.connection());
    println!("Unit size  : {}", session.unit_size());
    println!("Unit CRC   : {}", session.unit_crc());
    println!("Bytes      : {}", total);
    println!("Pulls      : {}", host.pulls().len());
    println!("CRC32      : 0x{:08X}", actual);
    println!("Valid      : {}", valid);

    session.close()?;

    if !valid {
        bail!("received image does not match source");
    }
    Ok(())
}
