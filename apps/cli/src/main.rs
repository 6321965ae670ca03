use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use mdt_core::{
    Config, Connection, ConnectionKind, Context, DeviceInfo, DeviceKind, DeviceWatcher, Role,
    TransportFactory,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often the watcher is drained.
const TICK: Duration = Duration::from_millis(100);
/// Largest payload a device accepts.
const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mobile device data transfer over USB", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print devices as they attach and detach
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Host side: send a file to the companion process on a device
    Send {
        /// File to send
        file: PathBuf,

        /// Target device UDID or serial (default: first device found)
        #[arg(long)]
        udid: Option<String>,

        /// Seconds to wait for the device to show up
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Device side: accept one host and store the file it sends
    Listen {
        /// Where to write the received file
        #[arg(short, long)]
        output: PathBuf,

        /// Port to listen on (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a config file with every default spelled out
    InitConfig {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
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

fn run(args: Args) -> Result<()> {
    if let Commands::InitConfig { path, force } = &args.command {
        if path.exists() && !force {
            bail!("{} exists, pass --force to overwrite", path.display());
        }
        Config::default().save_to_file(path)?;
        info!(path = %path.display(), "Config written");
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let runtime = Runtime::new()?;
    let ctx = Arc::new(Context::from_config(config, runtime.handle().clone()));

    match args.command {
        Commands::Watch { seconds } => watch(ctx, &runtime, seconds),
        Commands::Send { file, udid, wait } => send(ctx, &runtime, file, udid, wait),
        Commands::Listen { output, port } => listen(ctx, &runtime, output, port),
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Cancelled on Ctrl-C.
fn ctrl_c_token(runtime: &Runtime) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            cancel.cancel();
        }
    });
    token
}

fn watch(ctx: Arc<Context>, runtime: &Runtime, seconds: Option<u64>) -> Result<()> {
    let mut watcher = DeviceWatcher::new(ctx);
    watcher.on_device_added(|d| println!("+ {} [{}] {}", d.udid(), d.kind(), d.name()));
    watcher.on_device_removed(|d| println!("- {} [{}]", d.udid(), d.kind()));
    watcher.on_device_paired(|d| println!("* {} paired", d.udid()));

    watcher.start()?;

    let stop = ctrl_c_token(runtime);
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut degraded = false;
    while !stop.is_cancelled() && deadline.is_none_or(|d| Instant::now() < d) {
        if watcher.is_degraded() && !degraded {
            warn!(active = ?watcher.active_backends(), "Running with reduced discovery");
        }
        degraded = watcher.is_degraded();
        watcher.drain();
        thread::sleep(TICK);
    }

    watcher.stop();
    Ok(())
}

fn wait_for_device(ctx: Arc<Context>, udid: Option<&str>, wait: Duration) -> Result<DeviceInfo> {
    let mut watcher = DeviceWatcher::new(ctx);
    watcher.start()?;

    let deadline = Instant::now() + wait;
    loop {
        watcher.drain();
        let found = match udid {
            Some(udid) => watcher.device(udid).cloned(),
            None => watcher.devices().into_iter().next(),
        };
        if let Some(device) = found {
            return Ok(device);
        }
        if Instant::now() >= deadline {
            bail!("no device found within {}s", wait.as_secs());
        }
        thread::sleep(TICK);
    }
}

fn send(
    ctx: Arc<Context>,
    runtime: &Runtime,
    file: PathBuf,
    udid: Option<String>,
    wait: u64,
) -> Result<()> {
    let payload = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let device = wait_for_device(ctx.clone(), udid.as_deref(), Duration::from_secs(wait))?;
    info!(udid = %device.udid(), name = %device.name(), kind = %device.kind(), "Target device");

    let factory = TransportFactory::new(&ctx, Role::Host);
    let conn = factory.connect(&device)?;
    let started = Instant::now();
    let result = runtime.block_on(send_framed(conn.as_ref(), payload, ctrl_c_token(runtime)));
    conn.disconnect();
    conn.dispose();

    let sent = result?;
    info!(bytes = sent, elapsed_ms = started.elapsed().as_millis() as u64, "Transfer complete");
    Ok(())
}

/// Length prefix, payload, then wait for the device to echo the length.
async fn send_framed(conn: &dyn Connection, payload: Vec<u8>, cancel: CancellationToken) -> Result<usize> {
    let len = i32::try_from(payload.len()).context("payload too large")?;
    conn.link().send_i32(len)?;

    let sent = conn.send_async(payload, cancel).await?;
    if sent != len as usize {
        bail!("peer closed after {sent} of {len} bytes");
    }

    match conn.link().receive_i32()? {
        Some(ack) if ack == len => Ok(sent),
        Some(ack) => bail!("device acknowledged {ack} bytes, expected {len}"),
        None => bail!("peer closed before acknowledging"),
    }
}

fn listen(ctx: Arc<Context>, runtime: &Runtime, output: PathBuf, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(ctx.config().transport.port);
    let factory = TransportFactory::new(&ctx, Role::Device);
    let local = DeviceInfo::new("local", "", DeviceKind::Android, ConnectionKind::Usbmuxd);
    let conn: Arc<dyn Connection> = Arc::from(factory.create_connection(&local)?);

    // Ctrl-C disposes the connection, which also ends a pending accept.
    let cancel = ctrl_c_token(runtime);
    {
        let conn = conn.clone();
        let cancel = cancel.clone();
        runtime.spawn(async move {
            cancel.cancelled().await;
            conn.dispose();
        });
    }

    info!(port, "Waiting for host");
    conn.connect(port)?;

    let data = runtime.block_on(receive_framed(conn.as_ref(), cancel))?;
    std::fs::write(&output, &data).with_context(|| format!("writing {}", output.display()))?;
    conn.link().send_i32(data.len() as i32)?;
    conn.disconnect();

    info!(bytes = data.len(), path = %output.display(), "File received");
    Ok(())
}

async fn receive_framed(conn: &dyn Connection, cancel: CancellationToken) -> Result<Vec<u8>> {
    let len = conn
        .link()
        .receive_i32()?
        .context("host closed before sending a length")?;
    let len = usize::try_from(len)
        .ok()
        .filter(|&n| n <= MAX_PAYLOAD)
        .with_context(|| format!("invalid payload length {len}"))?;

    let data = conn.receive_async(len, cancel).await?;
    if data.len() != len {
        bail!("host closed after {} of {len} bytes", data.len());
    }
    Ok(data)
}
