use clap::{Parser, Subcommand};
use devbridge::{
    parse_line, AdbBridge, BridgeConfig, Device, DeviceListener, DeviceRegistry, MiEvent,
    SessionOrchestrator, SessionState,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Parser, Debug)]
#[command(name = "droidbridge", version, about = "Android device bridge and MI debug session driver")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Poll the device list and report changes
    Watch {
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Parse MI output lines from stdin and print them as JSON
    Parse,
    /// Start a debug server on a device and attach an interactive client
    Debug {
        #[arg(short, long)]
        serial: String,
        /// Attach to a running process id
        #[arg(long, conflicts_with = "process")]
        pid: Option<u32>,
        /// Attach to the first process with this name
        #[arg(long)]
        process: Option<String>,
    },
}

struct PrintingListener;

impl DeviceListener for PrintingListener {
    fn device_connected(&self, device: &Arc<Device>) {
        println!("+ {}\t{}", device.serial(), device.state());
    }

    fn device_disconnected(&self, device: &Arc<Device>) {
        println!("- {}", device.serial());
    }

    fn device_persisted(&self, device: &Arc<Device>) {
        log::trace!("= {}\t{}", device.serial(), device.state());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("devbridge", level)
        .with_module_level("droidbridge", level)
        .init()?;

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    }
    .with_env_overrides();
    log::debug!("Using adb at {}", config.adb_path.display());

    match cli.command {
        Command::Devices { json } => devices(&config, json).await?,
        Command::Watch { interval_ms } => watch(&config, Duration::from_millis(interval_ms)).await?,
        Command::Parse => parse_stdin().await?,
        Command::Debug { serial, pid, process } => debug(config, &serial, pid, process).await?,
    }
    Ok(())
}

async fn devices(config: &BridgeConfig, json: bool) -> devbridge::Result<()> {
    let registry = DeviceRegistry::new(AdbBridge::from_config(config));
    registry.refresh().await?;

    let devices = registry.get_all();
    if json {
        let listing: Vec<_> = devices.iter().map(|d| d.as_ref()).collect();
        match serde_json::to_string_pretty(&listing) {
            Ok(text) => println!("{text}"),
            Err(e) => log::error!("Failed to encode device list: {}", e),
        }
    } else {
        println!("List of devices attached");
        for device in devices {
            println!("{}\t{}", device.serial(), device.state());
        }
    }
    Ok(())
}

async fn watch(config: &BridgeConfig, interval: Duration) -> std::io::Result<()> {
    let registry = Arc::new(DeviceRegistry::new(AdbBridge::from_config(config)));
    registry.register_listener(Arc::new(PrintingListener));

    let poller = registry.spawn_polling(interval);
    let stopped = tokio::signal::ctrl_c().await;
    poller.abort();
    stopped
}

async fn parse_stdin() -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Ok(Some(output)) => match serde_json::to_string(&output) {
                Ok(text) => println!("{text}"),
                Err(e) => log::error!("Failed to encode record: {}", e),
            },
            Ok(None) => {}
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}

async fn debug(
    mut config: BridgeConfig,
    serial: &str,
    pid: Option<u32>,
    process: Option<String>,
) -> devbridge::Result<()> {
    let registry = Arc::new(DeviceRegistry::new(AdbBridge::from_config(&config)));
    registry.refresh().await?;

    let Some(device) = registry.get(serial) else {
        eprintln!("Device {serial} is not attached");
        return Ok(());
    };

    if let Some(name) = process {
        match device.find_process(registry.bridge(), &name).await? {
            Some(found) => config.server.attach_pid = Some(found),
            None => {
                eprintln!("No process named {name} on {serial}");
                return Ok(());
            }
        }
    } else if pid.is_some() {
        config.server.attach_pid = pid;
    }

    let session = SessionOrchestrator::new(device, registry.bridge().clone(), config);
    session.watch_registry(&registry);
    session.events().subscribe(|event: &MiEvent| match event {
        MiEvent::Async(record) => println!("{record}"),
        MiEvent::Stream(stream) => print!("{}", stream.content),
        MiEvent::Output(text) => println!("{text}"),
        MiEvent::UnmatchedResult(record) => println!("{record}"),
        MiEvent::Terminated(code) => println!("debugger exited ({code:?})"),
    });

    session.start_server().await?;
    // Keeps the device list current so an unplugged device stops the session
    let poller = registry.spawn_polling(DEVICE_POLL_INTERVAL);
    if let Err(e) = session.attach_client().await {
        poller.abort();
        session.terminate().await?;
        return Err(e.into());
    }
    println!("Attached to {serial}. Enter MI commands, `continue`, `interrupt` or `quit`.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let outcome = match line {
            "" => continue,
            "quit" | "q" => break,
            "continue" | "c" => session.continue_execution().await,
            "interrupt" => session.interrupt().await,
            command => session.send_command(command).await.map(|record| println!("{record}")),
        };
        if let Err(e) = outcome {
            eprintln!("{e}");
        }
        if matches!(session.state(), SessionState::Stopped | SessionState::Terminated) {
            break;
        }
    }

    poller.abort();
    if let Err(e) = session.detach().await {
        log::warn!("Detach failed: {}", e);
    }
    session.terminate().await?;
    Ok(())
}
