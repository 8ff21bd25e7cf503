use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wifirouter::config::{DEFAULT_SOCKET_NAME, resolve_config_path};
use wifirouter::netlink;
use wifirouter::{
    ControlListener, EventLoop, LoopOptions, MacAddress, NetlinkSocket, RouterClient, RouterConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "wifirouter",
    version,
    about = "Routes mac80211_hwsim frames to virtual machines by MAC address"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the router daemon
    Serve {
        #[arg(short, long)]
        config: Option<String>,
        /// Abstract-namespace name of the control socket
        #[arg(long)]
        socket_name: Option<String>,
    },
    /// Register MAC addresses with a running router and log delivered frames
    Listen {
        #[arg(long, default_value = DEFAULT_SOCKET_NAME)]
        socket_name: String,
        #[arg(long = "mac", required = true)]
        macs: Vec<MacAddress>,
        /// Exit after this many frames
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            socket_name,
        } => run_serve(config, socket_name),
        Commands::Listen {
            socket_name,
            macs,
            count,
        } => {
            init_tracing("info");
            run_listen(&socket_name, &macs, count)
        }
    }
}

fn run_serve(config: Option<String>, socket_name: Option<String>) -> Result<()> {
    let path = resolve_config_path(config)?;
    let mut cfg = match path.as_deref() {
        Some(p) => RouterConfig::load(p)?,
        None => RouterConfig::default(),
    };
    if let Some(name) = socket_name {
        cfg.socket_name = name;
    }
    cfg.validate().context("invalid configuration")?;
    init_tracing(&cfg.log_level);
    match path.as_deref() {
        Some(p) => info!("loaded config: {p}"),
        None => info!("no config file found, using defaults"),
    }

    let family = netlink::resolve_family(&cfg.family_name)?;
    let mut netlink = NetlinkSocket::connect()?;
    netlink.register_for_notifications(family)?;
    let listener = ControlListener::bind(&cfg.socket_name, cfg.backlog)?;

    let mut event_loop = EventLoop::new(listener, netlink, LoopOptions::new(family, &cfg))?;
    let shutdown = event_loop.shutdown_handle();
    ctrlc::set_handler(move || {
        if let Err(err) = shutdown.signal() {
            error!("failed to signal shutdown: {err:#}");
        }
    })
    .context("failed to install signal handler")?;
    event_loop.run()
}

fn run_listen(socket_name: &str, macs: &[MacAddress], count: Option<usize>) -> Result<()> {
    let mut client = RouterClient::connect(socket_name)?;
    for mac in macs {
        client.register(*mac)?;
        info!("registered mac={mac} on @{socket_name}");
    }
    let mut received = 0usize;
    while count.is_none_or(|limit| received < limit) {
        let frame = client.recv_frame()?;
        received += 1;
        info!("frame #{received} from mac={} len={}", frame.mac, frame.packet.len());
    }
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
