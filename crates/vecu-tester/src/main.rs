//! DoIP/UDS tester client for the vECU simulator.
//!
//! Each invocation performs exactly one diagnostic action against the
//! ECU: identify the vehicle, read or write a cruise-control parameter,
//! enter the programming session, or stream a firmware file through the
//! OTA sequence.
//!
//! # Usage
//!
//! ```bash
//! vecu-tester --identify
//! vecu-tester --set-kp 0.5
//! vecu-tester --program
//! vecu-tester --update new_firmware.bin
//! ```
//!
//! Exits 1 when the ECU answers with a negative response.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tracing::{debug, info};

use vecu_core::digest::sha256_hex;
use vecu_core::doip::{self, payload_type, Frame};
use vecu_core::uds::{self, routine_id, service_id, DataId};

#[derive(Parser, Debug)]
#[command(name = "vecu-tester")]
#[command(about = "DoIP/UDS tester client for the virtual ECU")]
struct Args {
    /// ECU host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// ECU DoIP port
    #[arg(long, default_value_t = 13400)]
    port: u16,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    command: Command,
}

/// Exactly one diagnostic action per invocation.
#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct Command {
    /// Get the vehicle VIN
    #[arg(long)]
    identify: bool,

    /// Enter the programming session for OTA
    #[arg(long)]
    program: bool,

    /// Perform an OTA update with a firmware file
    #[arg(long, value_name = "FILE")]
    update: Option<PathBuf>,

    /// Read the lead vehicle speed
    #[arg(long)]
    get_lead_speed: bool,

    /// Read the own vehicle speed
    #[arg(long)]
    get_own_speed: bool,

    /// Read the following-gap setting
    #[arg(long)]
    get_gap: bool,

    /// Read the proportional gain
    #[arg(long)]
    get_kp: bool,

    /// Read the integral gain
    #[arg(long)]
    get_ki: bool,

    /// Set the lead vehicle speed (mph)
    #[arg(long, value_name = "MPH")]
    set_lead_speed: Option<f64>,

    /// Set the following-gap setting (car lengths)
    #[arg(long, value_name = "CARS")]
    set_gap: Option<f64>,

    /// Set the proportional gain (e.g. 0.4)
    #[arg(long, value_name = "VALUE")]
    set_kp: Option<f64>,

    /// Set the integral gain (e.g. 0.1)
    #[arg(long, value_name = "VALUE")]
    set_ki: Option<f64>,

    /// Set the maximum acceleration (mph per cycle)
    #[arg(long, value_name = "VALUE")]
    set_max_accel: Option<f64>,

    /// Set the maximum deceleration (mph per cycle)
    #[arg(long, value_name = "VALUE")]
    set_max_decel: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "vecu_tester=debug,vecu_core=debug"
    } else {
        "vecu_tester=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = (args.host.as_str(), args.port);
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to ECU at {}:{}", args.host, args.port))?;
    debug!(host = %args.host, port = args.port, "connected");

    let c = &args.command;
    if c.identify {
        identify(&mut stream).await
    } else if c.program {
        enter_programming_session(&mut stream).await
    } else if let Some(file) = &c.update {
        perform_update(&mut stream, file).await
    } else if c.get_lead_speed {
        read_parameter(&mut stream, 0xF101, "lead vehicle speed").await
    } else if c.get_own_speed {
        read_parameter(&mut stream, 0xF103, "own vehicle speed").await
    } else if c.get_gap {
        read_parameter(&mut stream, 0xF102, "gap setting").await
    } else if c.get_kp {
        read_parameter(&mut stream, 0xD101, "proportional gain").await
    } else if c.get_ki {
        read_parameter(&mut stream, 0xD102, "integral gain").await
    } else if let Some(value) = c.set_lead_speed {
        write_parameter(&mut stream, 0xF101, value).await
    } else if let Some(value) = c.set_gap {
        write_parameter(&mut stream, 0xF102, value).await
    } else if let Some(value) = c.set_kp {
        write_parameter(&mut stream, 0xD101, value).await
    } else if let Some(value) = c.set_ki {
        write_parameter(&mut stream, 0xD102, value).await
    } else if let Some(value) = c.set_max_accel {
        write_parameter(&mut stream, 0xD103, value).await
    } else if let Some(value) = c.set_max_decel {
        write_parameter(&mut stream, 0xD104, value).await
    } else {
        // clap's required group guarantees one flag is set.
        unreachable!("no command selected");
    }
}

/// One request/response exchange. A DoIP negative acknowledgement or a
/// UDS negative response is an error.
async fn exchange(stream: &mut TcpStream, payload_type: u16, payload: &[u8]) -> Result<Frame> {
    doip::write_frame(stream, payload_type, payload).await?;
    let frame = doip::read_frame(stream)
        .await?
        .context("ECU closed the connection")?;

    if frame.payload_type == payload_type::NEGATIVE_ACK || frame.payload.first() == Some(&0x7F) {
        bail!("ECU returned a negative response");
    }
    Ok(frame)
}

async fn identify(stream: &mut TcpStream) -> Result<()> {
    let frame = exchange(stream, payload_type::VEHICLE_IDENTIFICATION_REQUEST, &[]).await?;
    println!("Vehicle VIN: {}", String::from_utf8_lossy(&frame.payload));
    Ok(())
}

async fn enter_programming_session(stream: &mut TcpStream) -> Result<()> {
    let [rid_hi, rid_lo] = routine_id::ENTER_PROGRAMMING_SESSION.to_be_bytes();
    let request = [service_id::ROUTINE_CONTROL, 0x01, rid_hi, rid_lo];
    exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;
    println!("ECU entered programming session");
    Ok(())
}

fn data_id(did: u16) -> &'static DataId {
    // The tester only ever asks for DIDs out of the shared table.
    uds::lookup(did).expect("DID missing from table")
}

async fn read_parameter(stream: &mut TcpStream, did: u16, label: &str) -> Result<()> {
    let [hi, lo] = did.to_be_bytes();
    let request = [service_id::READ_DATA_BY_ID, hi, lo];
    let frame = exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;

    let raw = *frame
        .payload
        .get(3)
        .context("short ReadDataByIdentifier response")?;
    println!("{label}: {}", data_id(did).decode(raw));
    Ok(())
}

async fn write_parameter(stream: &mut TcpStream, did: u16, value: f64) -> Result<()> {
    let [hi, lo] = did.to_be_bytes();
    let request = [
        service_id::WRITE_DATA_BY_ID,
        hi,
        lo,
        data_id(did).encode(value),
    ];
    exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;
    println!("parameter 0x{did:04X} written");
    Ok(())
}

/// Stream a firmware file through the 0x34/0x36/0x37 sequence.
///
/// Blocks are 4096 bytes; the block counter starts at 1 and wraps
/// modulo 256. The transfer ends with the lowercase-hex SHA-256 of the
/// whole file.
async fn perform_update(stream: &mut TcpStream, file: &PathBuf) -> Result<()> {
    let data = std::fs::read(file)
        .with_context(|| format!("cannot read firmware file {}", file.display()))?;
    let digest = sha256_hex(&data);
    info!(
        file = %file.display(),
        size = data.len(),
        %digest,
        "starting OTA update"
    );

    let mut request = vec![service_id::REQUEST_DOWNLOAD, 0x00, 0x44, 0, 0, 0, 0];
    request.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let frame = exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;
    if frame.payload.first() != Some(&0x74) {
        bail!("unexpected RequestDownload response");
    }

    let mut block_counter: u8 = 1;
    for chunk in data.chunks(4096) {
        let mut request = vec![service_id::TRANSFER_DATA, block_counter];
        request.extend_from_slice(chunk);
        exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;
        debug!(block = block_counter, bytes = chunk.len(), "block transferred");
        block_counter = block_counter.wrapping_add(1);
    }

    let mut request = vec![service_id::REQUEST_TRANSFER_EXIT];
    request.extend_from_slice(digest.as_bytes());
    let frame = exchange(stream, payload_type::DIAGNOSTIC_MESSAGE, &request).await?;
    if frame.payload.first() != Some(&0x77) {
        bail!("unexpected RequestTransferExit response");
    }

    println!("update accepted, ECU is swapping the application module");
    Ok(())
}
