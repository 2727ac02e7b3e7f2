//-----------------------------------------------------------------------------
// xcp_client - XCP master command line front end
// Connects to a XCP on Ethernet target, unlocks protected resources, reads and writes memory
// and measures data using the DAQ protocol or by polling.
//
// Run:
// cargo r -p xcp_client -- -h
// cargo r -p xcp_client -- -d 127.0.0.1:5555 -m 0x1000:4:0:u32 0x1004:2:1:i16 -t 2000

use std::error::Error;
use std::time::Duration;

use xcp_master::*;

//-----------------------------------------------------------------------------
// Command line arguments

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // -l --log-level
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    // -d --dest_addr
    /// XCP target address
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    dest_addr: String,

    // -b -- bind-addr
    /// Bind address, master port number
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind_addr: String,

    // -c --config
    /// Master configuration json file
    #[arg(short, long)]
    config: Option<String>,

    // --timeout
    /// Command response timeout in ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    // --retries
    /// Number of command resends after a timeout
    #[arg(long)]
    retries: Option<u32>,

    // -k --key-mask
    /// Hex xor mask for seed and key, e.g. "55AA"
    #[arg(short, long)]
    key_mask: Option<String>,

    // --key-cmd
    /// External key generator program, called with <resource> <seed hex>
    #[arg(long)]
    key_cmd: Option<String>,

    // -m --mea
    /// DAQ measurement bindings addr:size:event[:type], e.g. 0x1000:4:0:u32
    #[arg(short, long, value_parser = parse_binding, value_delimiter = ' ', num_args = 1..)]
    mea: Vec<MeasurementBinding>,

    // -p --poll
    /// Polled bindings addr:size:period_ms[:type], read by SHORT_UPLOAD, e.g. 0x1000:4:100:u32
    #[arg(short, long, value_parser = parse_polling, value_delimiter = ' ', num_args = 1..)]
    poll: Vec<PollingBinding>,

    // -t --time
    /// Specify measurement duration in ms
    #[arg(short, long, default_value_t = 5000)]
    time_ms: u64,

    // --read
    /// Read memory addr:size, e.g. 0x1000:16
    #[arg(long, value_parser = parse_read)]
    read: Option<(u32, usize)>,

    // --write
    /// Write memory addr:hexbytes, e.g. 0x1000:01020304
    #[arg(long, value_parser = parse_write)]
    write: Option<(u32, Vec<u8>)>,

    // --layout
    /// Print the negotiated session configuration and the DAQ layout as json
    #[arg(long, default_value_t = false)]
    layout: bool,
}

//----------------------------------------------------------------------------------------------
// Logging

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

//-----------------------------------------------------------------------------
// Argument parsers

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
    } else {
        s.parse().map_err(|e| format!("invalid number '{}': {}", s, e))
    }
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    if s.is_empty() || s.len() % 2 != 0 {
        return Err(format!("invalid hex bytes '{}'", s));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            let digits = s.get(i..i + 2).ok_or_else(|| format!("invalid hex bytes '{}'", s))?;
            u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex bytes '{}': {}", s, e))
        })
        .collect()
}

// addr:size:event[:type]
fn parse_binding(s: &str) -> Result<MeasurementBinding, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!("expected addr:size:event[:type], got '{}'", s));
    }
    let address = parse_u32(parts[0])?;
    let size = parse_u32(parts[1])? as usize;
    let event = u16::try_from(parse_u32(parts[2])?).map_err(|e| format!("invalid event '{}': {}", parts[2], e))?;
    let mut binding = MeasurementBinding::bytes(address, size, event);
    if let Some(t) = parts.get(3) {
        let value_type: ValueType = t.parse()?;
        if value_type.size().is_some_and(|n| n != size) {
            return Err(format!("size {} does not match type {:?}", size, value_type));
        }
        binding.value_type = value_type;
    }
    Ok(binding)
}

// addr:size:period_ms[:type]
fn parse_polling(s: &str) -> Result<PollingBinding, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!("expected addr:size:period_ms[:type], got '{}'", s));
    }
    let address = parse_u32(parts[0])?;
    let size = parse_u32(parts[1])? as usize;
    let period = Duration::from_millis(parse_u32(parts[2])? as u64);
    let mut binding = PollingBinding::bytes(address, size, period);
    if let Some(t) = parts.get(3) {
        binding.value_type = t.parse()?;
    }
    binding.validate(usize::MAX).map_err(|e| e.to_string())?;
    Ok(binding)
}

fn parse_read(s: &str) -> Result<(u32, usize), String> {
    let (addr, size) = s.split_once(':').ok_or_else(|| format!("expected addr:size, got '{}'", s))?;
    Ok((parse_u32(addr)?, parse_u32(size)? as usize))
}

fn parse_write(s: &str) -> Result<(u32, Vec<u8>), String> {
    let (addr, data) = s.split_once(':').ok_or_else(|| format!("expected addr:hexbytes, got '{}'", s))?;
    Ok((parse_u32(addr)?, parse_hex_bytes(data)?))
}

//------------------------------------------------------------------------
// Measurement

async fn measure(xcp: &XcpMaster, bindings: &[MeasurementBinding], time_ms: u64, layout: bool) -> Result<(), Box<dyn Error>> {
    let lists = xcp.allocate(bindings).await?;
    info!("DAQ layout: {} lists, {} ODTs", lists.len(), lists.iter().map(DaqList::odt_count).sum::<usize>());
    for list in &lists {
        info!("  daq={} event={} odts={:?} timestamp={}", list.number, list.event, list.odt_sizes, list.timestamp);
    }
    if layout {
        println!("{}", serde_json::to_string_pretty(&lists)?);
    }

    let start_time = tokio::time::Instant::now();
    xcp.start().await?;
    let mut interval = tokio::time::interval(Duration::from_millis(1000));
    interval.tick().await;
    while start_time.elapsed() < Duration::from_millis(time_ms) {
        interval.tick().await;
        for (i, b) in bindings.iter().enumerate() {
            let id = BindingId(i);
            let (timestamp, samples) = xcp.sample_info(id)?;
            match xcp.read_latest_value(id)? {
                Some(v) => println!(" 0x{:08X} = {} (samples={}, t={:?})", b.address, v, samples, timestamp),
                None => println!(" 0x{:08X} = -", b.address),
            }
        }
    }
    xcp.stop().await?;
    let elapsed_time = start_time.elapsed().as_micros();

    let stats = xcp.statistics().await;
    info!(
        "Measurement done, {} frames, {:.0} frames/s, lost={} anomalies={} malformed={} overflow={}",
        stats.daq.frames,
        stats.daq.frames as f64 * 1_000_000.0 / elapsed_time as f64,
        stats.channel.lost,
        stats.daq.anomalies,
        stats.daq.malformed + stats.channel.malformed,
        stats.channel.daq_overflow
    );
    Ok(())
}

async fn poll(xcp: &XcpMaster, bindings: &[PollingBinding], time_ms: u64) -> Result<(), Box<dyn Error>> {
    let ids = xcp.set_polling(bindings).await?;
    let start_time = tokio::time::Instant::now();
    while start_time.elapsed() < Duration::from_millis(time_ms) {
        xcp.run_polling(Duration::from_millis(1000)).await?;
        for (id, b) in ids.iter().zip(bindings) {
            match xcp.read_polled_value(*id)? {
                Some(v) => println!(" 0x{:08X} = {} (samples={})", b.address, v, xcp.polled_samples(*id)?),
                None => println!(" 0x{:08X} = -", b.address),
            }
        }
    }
    let stats = xcp.statistics().await.polling;
    info!("Polling done, {} samples, {} errors", stats.samples, stats.errors);
    Ok(())
}

//------------------------------------------------------------------------
// Session

async fn xcp_client(xcp: &XcpMaster, args: &Args) -> Result<(), Box<dyn Error>> {
    info!("XCP Connect");
    let config = xcp.connect().await?;
    if args.layout {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    match xcp.get_id(XCP_IDT_ASCII).await {
        Ok(id) => info!("Target id: {}", String::from_utf8_lossy(&id)),
        Err(e) => warn!("GET_ID failed: {}", e),
    }

    if !config.protection.is_empty() && (args.key_mask.is_some() || args.key_cmd.is_some()) {
        match xcp.unlock(config.protection).await {
            Ok(remaining) => info!("Unlocked, remaining protection {:?}", remaining),
            Err(XcpError::UnlockDenied(r)) => warn!("Unlock of {:?} denied", r),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some((addr, size)) = args.read {
        let data = xcp.read_memory(addr, 0, size).await?;
        println!("0x{:08X}: {:02X?}", addr, data);
    }

    if let Some((addr, data)) = &args.write {
        xcp.write_memory(*addr, 0, data).await?;
        info!("Wrote {} bytes to 0x{:08X}", data.len(), addr);
    }

    if !args.mea.is_empty() {
        measure(xcp, &args.mea, args.time_ms, args.layout).await?;
    }

    if !args.poll.is_empty() {
        poll(xcp, &args.poll, args.time_ms).await?;
    }

    info!("XCP Disconnect");
    xcp.disconnect().await?;
    Ok(())
}

//------------------------------------------------------------------------
// Main function

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let log_level = XcpLogLevel::from(args.log_level).to_log_level_filter();
    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let dest_addr: std::net::SocketAddr = args.dest_addr.parse().map_err(|e| format!("{}", e))?;
    let bind_addr: std::net::SocketAddr = args.bind_addr.parse().map_err(|e| format!("{}", e))?;
    info!("dest_addr: {}", dest_addr);
    info!("bind_addr: {}", bind_addr);

    let mut builder = XcpMasterBuilder::new();
    if let Some(path) = &args.config {
        builder = builder.set_config(MasterConfig::load_json(path)?);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        builder = builder.set_command_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(retries) = args.retries {
        builder = builder.set_max_retries(retries);
    }
    if let Some(mask) = &args.key_mask {
        builder = builder.set_key_provider(XorKeyProvider::new(&parse_hex_bytes(mask)?));
    } else if let Some(program) = &args.key_cmd {
        builder = builder.set_key_provider(CommandKeyProvider::new(program.as_str(), &[]));
    }

    let transport = UdpTransport::bind(bind_addr, dest_addr).await?;
    let xcp = builder.build(transport);

    let result = xcp_client(&xcp, &args).await;
    if let Err(e) = &result {
        error!("{}", e);
        let _ = xcp.disconnect().await;
    }
    result
}
