//! # OSD command line tool
//!
//! Inspects Open SoC Debug targets and serves a simulated target for experiments.
//!
//! - `osd serve` runs a demo target with a subnet control module, a memory and two trace modules
//! - `osd ls` lists the modules of a target
//! - `osd reg`, `osd mem` access registers and memory
//! - `osd trace` streams the events of a trace module
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_num::maybe_hex;
use env_logger::Env;
use osd_host::{
    Builder, ModuleDriver, Session, TransportConfig,
    driver::{TraceData, TraceItem},
};
use osd_protocol::{
    ModuleAddress,
    payload::{CtmEvent, RegisterWidth, StmEvent},
};
use osd_target::{
    Target,
    modules::{Ctm, Mam, Scm, Stm},
    server,
};
use tokio::net::{TcpListener, UdpSocket};

const DEMO_VENDOR_ID: u16 = 0x0001;
const DEMO_DEVICE_ID: u16 = 0x0042;
const DEMO_MEMORY_SIZE: usize = 64 * 1024;

#[derive(ValueEnum, Eq, PartialEq, Clone, Copy, Debug)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Args, Clone, Debug)]
struct ConnectArgs {
    #[arg(short, long, default_value = "127.0.0.1:9537", help = "Address of the target")]
    target: String,

    #[arg(long, value_enum, default_value = "tcp")]
    transport: Transport,

    #[arg(long, default_value = "0.0.0.0:0", help = "Local address for UDP")]
    bind: String,

    #[arg(long, default_value = "1000", help = "The request timeout in milliseconds")]
    timeout_ms: u64,

    #[arg(long, default_value = "8")]
    max_pending: usize,

    #[arg(long, default_value = "3", help = "Describe retries during discovery")]
    retries: u32,

    #[arg(long, default_value = "1024")]
    mtu: usize,
}

impl ConnectArgs {
    async fn connect(&self) -> Result<Session, Box<dyn Error>> {
        let transport = match self.transport {
            Transport::Tcp => TransportConfig::tcp(&self.target),
            Transport::Udp => TransportConfig::udp(&self.bind, &self.target),
        };
        let session = Builder::new()
            .transport(transport)
            .timeout(Duration::from_millis(self.timeout_ms))
            .max_pending_per_module(self.max_pending)
            .retry_count(self.retries)
            .mtu(self.mtu)
            .connect()
            .await?;
        Ok(session)
    }
}

#[derive(Subcommand, Clone, Debug)]
enum RegCommand {
    Read {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u16>)]
        register: u16,
        #[arg(short, long, default_value = "16", help = "Register width in bits")]
        width: u8,
    },
    Write {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u16>)]
        register: u16,
        #[arg(value_parser = maybe_hex::<u64>)]
        value: u64,
        #[arg(short, long, default_value = "16", help = "Register width in bits")]
        width: u8,
    },
}

#[derive(Subcommand, Clone, Debug)]
enum MemCommand {
    Read {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u64>)]
        address: u64,
        #[arg(value_parser = maybe_hex::<usize>)]
        len: usize,
    },
    Write {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u64>)]
        address: u64,
        #[arg(help = "Data as hex string, e.g. deadbeef")]
        data: String,
    },
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Serve a simulated target
    Serve {
        #[arg(short, long, default_value = "9537")]
        port: u16,

        #[arg(short, long, default_value = "127.0.0.1")]
        ip: IpAddr,

        #[arg(long, help = "Answer datagrams instead of TCP connections")]
        udp: bool,

        #[arg(long, default_value = "1024")]
        mtu: usize,

        #[arg(long, default_value = "1000", help = "Interval of demo trace events in milliseconds")]
        event_interval_ms: u64,
    },
    /// List the modules of a target
    Ls {
        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Read or write a register
    Reg {
        #[command(flatten)]
        connect: ConnectArgs,
        #[command(subcommand)]
        command: RegCommand,
    },
    /// Read or write memory
    Mem {
        #[command(flatten)]
        connect: ConnectArgs,
        #[command(subcommand)]
        command: MemCommand,
    },
    /// Stream the events of a trace module
    Trace {
        #[command(flatten)]
        connect: ConnectArgs,
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(short, long, help = "Stop after this many events")]
        count: Option<usize>,
    },
}

#[derive(Parser)]
#[command(about = "Open SoC Debug host tool", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

fn parse_hex(data: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(data.trim_start_matches("0x"))
}

fn hexdump(address: u64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:#010x}: {}", address + (i * 16) as u64, bytes.join(" "));
    }
}

fn demo_target(event_interval: Duration) -> Result<Target, Box<dyn Error>> {
    let mut target = Target::new();
    target.add(Scm::new(ModuleAddress::SCM, DEMO_VENDOR_ID, DEMO_DEVICE_ID))?;
    target.add(Mam::new(ModuleAddress::new(0, 2), 0, DEMO_MEMORY_SIZE))?;
    let stm = Stm::new(ModuleAddress::new(0, 3), 32);
    let ctm = Ctm::new(ModuleAddress::new(0, 4));
    let (stm_events, ctm_events) = (stm.queue(), ctm.queue());
    target.add(stm)?;
    target.add(ctm)?;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(event_interval);
        let mut timestamp = 0u32;
        loop {
            ticker.tick().await;
            timestamp = timestamp.wrapping_add(1);
            stm_events.push(StmEvent {
                timestamp,
                id: 1,
                value: timestamp.into(),
            });
            ctm_events.push(CtmEvent {
                timestamp,
                pc: 0x8000_0000 + u64::from(timestamp % 16) * 4,
                kind: CtmEvent::KIND_CALL,
            });
        }
    });
    Ok(target)
}

async fn serve(
    addr: SocketAddr,
    udp: bool,
    mtu: usize,
    event_interval: Duration,
) -> Result<(), Box<dyn Error>> {
    let target = demo_target(event_interval)?;
    for module in target.modules() {
        log::info!("Serving module {}", module);
    }
    let server = server::Builder::new().mtu(mtu).build(target);
    log::info!("Binding to address: {}", addr);
    if udp {
        server.serve_udp(UdpSocket::bind(addr).await?).await?;
    } else {
        server.serve_tcp(TcpListener::bind(addr).await?).await?;
    }
    Ok(())
}

async fn list(session: &Session) {
    println!("{} module(s)", session.modules().len());
    for module in session.modules() {
        println!("  {}", module);
    }
    for degraded in session.degraded() {
        println!(
            "  {}: no descriptor after {} attempt(s) ({:?})",
            degraded.address, degraded.attempts, degraded.reason
        );
    }
    if let Ok(ModuleDriver::Control(scm)) = session.driver_for(ModuleAddress::SCM) {
        match scm.system_info().await {
            Ok(info) => println!(
                "System vendor {:#06x}, device {:#06x}, {} module(s), max packet length {}",
                info.vendor_id, info.device_id, info.num_modules, info.max_packet_len
            ),
            Err(e) => log::warn!("Could not read system information: {}", e),
        }
    }
}

async fn trace(session: &Session, module: ModuleAddress, count: Option<usize>) -> Result<(), Box<dyn Error>> {
    let ModuleDriver::Trace(driver) = session.driver_for(module)? else {
        return Err(format!("module {} is not a trace module", module).into());
    };
    let mut events = driver.events()?;
    driver.start().await?;
    let mut seen = 0;
    loop {
        let item = tokio::select! {
            item = events.next() => item,
            _ = tokio::signal::ctrl_c() => break,
        };
        match item {
            Some(TraceItem::Event(event)) => {
                match event.data {
                    TraceData::System(e) => println!(
                        "[{:>10}] {} id={:#06x} value={:#x}",
                        e.timestamp, event.source, e.id, e.value
                    ),
                    TraceData::Core(e) => println!(
                        "[{:>10}] {} pc={:#018x} kind={}",
                        e.timestamp, event.source, e.pc, e.kind
                    ),
                    TraceData::Raw(data) => println!("{} {:02x?}", event.source, data),
                }
                seen += 1;
                if count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            Some(TraceItem::Warning(warning)) => log::warn!("{:?}", warning),
            None => {
                log::error!("Session closed");
                return Ok(());
            }
        }
    }
    driver.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            ip,
            udp,
            mtu,
            event_interval_ms,
        } => {
            serve(
                SocketAddr::new(ip, port),
                udp,
                mtu,
                Duration::from_millis(event_interval_ms),
            )
            .await?
        }
        Command::Ls { connect } => list(&connect.connect().await?).await,
        Command::Reg { connect, command } => {
            let session = connect.connect().await?;
            match command {
                RegCommand::Read {
                    module,
                    register,
                    width,
                } => {
                    let driver = session.driver_for(ModuleAddress::from_raw(module))?;
                    let value = driver
                        .read_register(register, RegisterWidth::from_bits(width)?)
                        .await?;
                    println!("{:#x}", value);
                }
                RegCommand::Write {
                    module,
                    register,
                    value,
                    width,
                } => {
                    let driver = session.driver_for(ModuleAddress::from_raw(module))?;
                    driver
                        .write_register(register, RegisterWidth::from_bits(width)?, value.into())
                        .await?;
                }
            }
        }
        Command::Mem { connect, command } => {
            let session = connect.connect().await?;
            match command {
                MemCommand::Read {
                    module,
                    address,
                    len,
                } => {
                    let ModuleDriver::Memory(mam) = session.driver_for(ModuleAddress::from_raw(module))?
                    else {
                        return Err(format!("module {:#06x} is not a memory", module).into());
                    };
                    hexdump(address, &mam.read(address, len).await?);
                }
                MemCommand::Write {
                    module,
                    address,
                    data,
                } => {
                    let ModuleDriver::Memory(mam) = session.driver_for(ModuleAddress::from_raw(module))?
                    else {
                        return Err(format!("module {:#06x} is not a memory", module).into());
                    };
                    let data = parse_hex(&data)?;
                    mam.write(address, &data).await?;
                    log::info!("Wrote {} bytes at {:#x}", data.len(), address);
                }
            }
        }
        Command::Trace {
            connect,
            module,
            count,
        } => {
            let session = connect.connect().await?;
            trace(&session, ModuleAddress::from_raw(module), count).await?
        }
    }
    Ok(())
}
