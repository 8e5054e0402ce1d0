use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use toolblex::domain::models::{DeviceRecord, MessageSeverity};
use toolblex::domain::settings::SettingsService;
use toolblex::domain::vendor::VendorResolver;
use toolblex::infrastructure::bluetooth::protocol::describe_service;
use toolblex::infrastructure::bluetooth::simulated::SimulatedAdapter;
use toolblex::infrastructure::bluetooth::sniffer::SniffSource;
use toolblex::infrastructure::bluetooth::ubertooth::UbertoothSource;
use toolblex::infrastructure::logging::init_logger;
use toolblex::infrastructure::persistence::PersistenceStore;
use toolblex::{AdapterId, BleAdapter, DeviceManager, EngineEvent, MacAddress};
use tracing::{error, info, warn};

/// Bluetooth Low Energy scanner with device history.
#[derive(Parser, Debug)]
#[command(name = "toolblex", version, about)]
struct Cli {
    /// Adapter to scan with (see --list-adapters)
    #[arg(short, long)]
    adapter: Option<String>,

    /// Stop scanning after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Scan even if scanning at launch is disabled in the settings
    #[arg(short, long)]
    scan: bool,

    /// Use the built-in simulated radio instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Run the Ubertooth capture alongside the scan
    #[arg(long, conflicts_with = "no_sniffer")]
    sniffer: bool,

    /// Never start the passive sniffer
    #[arg(long)]
    no_sniffer: bool,

    /// OUI vendor table (IEEE oui.txt or Wireshark manuf format)
    #[arg(long)]
    vendors: Option<PathBuf>,

    /// Device history file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Connect to this device once it has been seen (repeatable)
    #[arg(short, long, value_name = "ADDRESS")]
    connect: Vec<String>,

    /// Remove this device from the history (repeatable)
    #[arg(long, value_name = "ADDRESS")]
    forget: Vec<String>,

    /// Print the available adapters and exit
    #[arg(long)]
    list_adapters: bool,
}

fn backend(cli: &Cli) -> Result<Arc<dyn BleAdapter>> {
    if cli.simulate {
        return Ok(Arc::new(SimulatedAdapter::demo()));
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(
            toolblex::infrastructure::bluetooth::winrt::WinRtAdapter::new(),
        ))
    }
    #[cfg(not(windows))]
    {
        bail!("no native Bluetooth backend on this platform, run with --simulate")
    }
}

/// Ask on stdin which adapter to use when there is more than one.
async fn prompt_for_adapter(adapters: Vec<AdapterId>) -> Result<AdapterId> {
    tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        loop {
            println!("Available Bluetooth adapters:");
            for (index, adapter) in adapters.iter().enumerate() {
                println!("  [{}] {}", index, adapter);
            }
            print!("Select adapter index: ");
            io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                bail!("no adapter selected");
            }
            match line.trim().parse::<usize>() {
                Ok(index) if index < adapters.len() => return Ok(adapters[index].clone()),
                _ => println!("Invalid choice: {}", line.trim()),
            }
        }
    })
    .await?
}

fn print_device(record: &DeviceRecord) {
    let rssi = record
        .rssi
        .map(|r| format!("{:>4} dBm", r))
        .unwrap_or_else(|| "   - dBm".to_string());
    println!(
        "{}  {}  {:<24}  {:<28}  {:?}",
        record.address,
        rssi,
        record.display_name.as_deref().unwrap_or("(unnamed)"),
        record.vendor.as_deref().unwrap_or("-"),
        record.source,
    );
    for service in &record.advertised_services {
        println!("    {}", describe_service(service));
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::ScanStarted {
            adapter,
            generation,
        } => info!(%adapter, generation, "Scan started"),
        EngineEvent::ScanEnded { generation, reason } => {
            info!(generation, ?reason, "Scan ended")
        }
        EngineEvent::DeviceUpdated(record) => print_device(record),
        EngineEvent::DeviceRemoved(address) => println!("{}  removed", address),
        EngineEvent::ConnectionStateChanged { address, state } => {
            println!("{}  {}", address, state)
        }
        EngineEvent::VendorTableLoadFailure(reason) => {
            warn!("Vendor names unavailable: {}", reason)
        }
        EngineEvent::PersistenceCorruption { discarded_lines } => warn!(
            "Device history was damaged, {} line(s) dropped",
            discarded_lines
        ),
        EngineEvent::SnifferUnavailable(reason) => warn!("Sniffer unavailable: {}", reason),
        EngineEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Error => error!("{}", message.message),
            MessageSeverity::Warning => warn!("{}", message.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message.message),
        },
    }
}

/// Wait until `address` shows up in the registry, then connect.
async fn connect_when_seen(manager: Arc<DeviceManager>, address: MacAddress) {
    let mut devices = manager.subscribe_devices();
    let label = loop {
        if let Some(label) = devices
            .borrow_and_update()
            .iter()
            .find(|d| d.address == address)
            .map(DeviceRecord::label)
        {
            break label;
        }
        if devices.changed().await.is_err() {
            return;
        }
    };
    info!(%address, "Connecting to {}", label);
    if let Err(e) = manager.connect(address).await {
        error!(%address, "Connect to {} failed: {}", label, e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.settings {
        Some(path) => SettingsService::at(path.clone()),
        None => SettingsService::new()?,
    };

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    {
        let engine = &mut settings_service.get_mut().engine;
        if let Some(duration) = cli.duration {
            engine.scan_duration_secs = Some(duration);
        }
        if let Some(path) = &cli.database {
            engine.database_path = Some(path.to_string_lossy().into_owned());
        }
        if let Some(path) = &cli.vendors {
            engine.vendor_table_path = Some(path.to_string_lossy().into_owned());
        }
        if cli.sniffer {
            engine.sniffer.enabled = true;
        }
        if cli.no_sniffer {
            engine.sniffer.enabled = false;
        }
    }

    let adapter = backend(&cli)?;
    let adapters = adapter
        .list_adapters()
        .await
        .context("listing Bluetooth adapters")?;

    if cli.list_adapters {
        for id in &adapters {
            println!("{}", id);
        }
        return Ok(());
    }

    let wants_scan = cli.scan
        || cli.duration.is_some()
        || !cli.connect.is_empty()
        || settings_service.get().engine.scan_auto;

    let selected = match cli.adapter.clone() {
        Some(id) => Some(AdapterId::new(id)),
        None => match settings_service.get().engine.adapter.clone() {
            Some(id) => Some(AdapterId::new(id)),
            None if wants_scan && adapters.len() > 1 => {
                let choice = prompt_for_adapter(adapters.clone()).await?;
                settings_service.get_mut().engine.adapter = Some(choice.to_string());
                if let Err(e) = settings_service.save() {
                    warn!("Could not remember adapter choice: {}", e);
                }
                Some(choice)
            }
            None => None,
        },
    };

    let engine_settings = settings_service.get().engine.clone();
    let vendors = Arc::new(match &engine_settings.vendor_table_path {
        Some(path) => VendorResolver::load(path),
        None => VendorResolver::empty(),
    });
    let store = PersistenceStore::open(engine_settings.database_path());
    let sniff_source: Option<Arc<dyn SniffSource>> = if engine_settings.sniffer.enabled {
        Some(Arc::new(UbertoothSource::from_settings(
            &engine_settings.sniffer,
        )))
    } else {
        None
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(
        DeviceManager::new(
            engine_settings,
            adapter,
            vendors,
            store,
            sniff_source,
            event_tx,
        )
        .await,
    );

    for raw in &cli.forget {
        let address = MacAddress::parse(raw)?;
        match manager.forget(address).await {
            Ok(()) => println!("{}  forgotten", address),
            Err(e) => warn!("{}", e),
        }
    }

    if !wants_scan {
        for record in manager.devices() {
            print_device(&record);
        }
        manager.shutdown().await;
        return Ok(());
    }

    let generation = manager.start_scan(selected).await?;

    for raw in &cli.connect {
        let address = MacAddress::parse(raw)?;
        tokio::spawn(connect_when_seen(Arc::clone(&manager), address));
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            event = event_rx.recv() => match event {
                Some(event) => {
                    print_event(&event);
                    if let EngineEvent::ScanEnded { generation: ended, .. } = event {
                        if ended == generation {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    manager.shutdown().await;
    while let Ok(event) = event_rx.try_recv() {
        print_event(&event);
    }
    println!("{} device(s) known", manager.devices().len());
    Ok(())
}
