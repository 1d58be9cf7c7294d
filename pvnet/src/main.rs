use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pvnet::loopback::{GatewayPeer, LoopbackNetback};
use pvnet::wire::ETHERNET_HEADER_SIZE;
use pvnet::{
    Config, Device, EtharpLink, EtherType, HardwareAddress, LinkEndpoint, LinkError,
    NetworkDispatcher, Route,
};
use smoltcp::wire::{IpProtocol, Ipv4Packet};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// IPv4 header length without options
const IPV4_HEADER_LEN: usize = 20;

/// IP protocol number reserved for experimentation (RFC 3692)
const EXPERIMENTAL_PROTOCOL: u8 = 253;

#[derive(Parser)]
#[command(name = "pvnet")]
#[command(about = "Paravirtualized network link over a loopback netback")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the interface MAC address
    #[arg(long)]
    mac: Option<HardwareAddress>,

    /// Override the interface IPv4 address
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Address of the simulated gateway
    #[arg(long, default_value = "10.0.2.1")]
    peer_ip: Ipv4Addr,

    /// MAC address of the simulated gateway
    #[arg(long, default_value = "aa:bb:cc:dd:ee:ff")]
    peer_mac: HardwareAddress,

    /// Datagrams to send to the gateway
    #[arg(short = 'n', long, default_value_t = 3)]
    count: u32,

    /// Delay between datagrams in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

/// Logs everything the link delivers.
#[derive(Default)]
struct LoggingDispatcher {
    received: AtomicU64,
}

impl NetworkDispatcher for LoggingDispatcher {
    fn deliver_network_packet(
        &self,
        endpoint: &dyn LinkEndpoint,
        source: HardwareAddress,
        protocol: EtherType,
        packet: &[u8],
    ) {
        self.received.fetch_add(1, Ordering::Relaxed);

        if protocol == EtherType::IPV4
            && let Ok(ip) = Ipv4Packet::new_checked(packet)
        {
            info!(
                link = %endpoint.link_address(),
                src_mac = %source,
                src_ip = %ip.src_addr(),
                dst_ip = %ip.dst_addr(),
                payload = %String::from_utf8_lossy(ip.payload()),
                "Received IPv4 datagram"
            );
            return;
        }
        info!(src_mac = %source, ?protocol, len = packet.len(), "Received packet");
    }

    fn resolution_failed(&self, error: LinkError) {
        warn!(error = %error, "Packets dropped");
    }
}

/// IPv4 header for `payload_len` bytes from `src` to `dst`.
fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    let mut packet = Ipv4Packet::new_unchecked(&mut header[..]);
    packet.set_version(4);
    packet.set_header_len(IPV4_HEADER_LEN as u8);
    packet.set_total_len((IPV4_HEADER_LEN + payload_len) as u16);
    packet.set_hop_limit(64);
    packet.set_next_header(IpProtocol::Unknown(EXPERIMENTAL_PROTOCOL));
    packet.set_src_addr(src);
    packet.set_dst_addr(dst);
    packet.fill_checksum();
    header
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(mac) = args.mac {
        config.interface.mac = mac;
    }
    if let Some(ip) = args.ip {
        config.interface.ip = ip;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pvnet=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        mac = %config.interface.mac,
        ip = %config.interface.ip,
        gateway = %args.peer_ip,
        "Starting pvnet"
    );

    let peer = GatewayPeer::new(args.peer_mac, args.peer_ip);
    let (mut netback, resources) = LoopbackNetback::new(&config, Some(Box::new(peer)))?;

    let device = Arc::new(Device::new(&config, resources)?);
    let fatal = device.fatal_errors();

    let link = EtharpLink::new(config.interface.ip, device.clone(), &config.arp);
    let dispatcher = Arc::new(LoggingDispatcher::default());
    link.attach(dispatcher.clone())?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut fatal_wait = tokio::task::spawn_blocking(move || fatal.recv().ok());

    let route = Route::new(config.interface.ip, args.peer_ip);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0u32;

    info!("Running (Ctrl+C to stop)");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            result = &mut fatal_wait => {
                if let Ok(Some(e)) = result {
                    error!(error = %e, "Device failed");
                }
                break;
            }
            _ = ticker.tick(), if sent < args.count => {
                let payload = format!("pvnet datagram {sent}");
                let header = ipv4_header(config.interface.ip, args.peer_ip, payload.len());
                match link.write_packet(&route, &header, payload.as_bytes(), EtherType::IPV4) {
                    Ok(()) => info!(seq = sent, bytes = ETHERNET_HEADER_SIZE + header.len() + payload.len(), "Sent datagram"),
                    Err(e) => error!(seq = sent, error = %e, "Send failed"),
                }
                sent += 1;
            }
        }
    }

    if let Err(e) = link.shutdown() {
        error!(error = %e, "Link shutdown reported an error");
    }
    netback.shutdown();

    // Releases the fatal-error sender so the blocking waiter returns
    drop(link);
    drop(device);

    info!(
        sent,
        received = dispatcher.received.load(Ordering::Relaxed),
        "Stopped"
    );
    Ok(())
}
