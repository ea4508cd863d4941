// entk: Exposure Notification toolkit CLI
//
// Cross-platform (macOS, Linux, Windows) command-line interface for generating
// and inspecting temporary keys, importing keys from other devices and
// scanning for their rolling identifiers.

mod central;
mod config;
mod known_keys;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use en_toolkit_core::crypto::{
    compute_identifier, decrypt_metadata, derive_metadata_key, derive_proximity_identifier_key,
    encrypt_metadata, AssociatedMetadata, TemporaryKey,
};
use en_toolkit_core::matching::{KeyImport, KnownKeyStore, KnownKeyTable};
use en_toolkit_core::platform::{AdvertisingState, ProximityService};
use en_toolkit_core::rotation::{epoch_start, Interval, RotationClock, SystemClock};
use en_toolkit_core::transport::ble::{AdvertisementPayload, LoopbackAir};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "entk")]
#[command(about = "Exposure Notification toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a temporary key for the current rolling period
    Generate,
    /// Show the key schedule of a temporary key
    Derive {
        /// Hex-encoded 16-byte secret
        #[arg(short, long)]
        key: String,
        /// Interval number (defaults to now)
        #[arg(short, long)]
        interval: Option<u32>,
        /// Transmit power in dBm (defaults to the configured value)
        #[arg(short, long, allow_hyphen_values = true)]
        tx_power: Option<i8>,
    },
    /// Import a key from another device
    Import {
        /// Secret as hex or base64
        key: String,
        #[arg(short, long)]
        label: Option<String>,
        /// First interval of the key's rolling period (defaults to the current one)
        #[arg(short, long)]
        rolling_start: Option<u32>,
        /// Keep previously imported keys
        #[arg(short, long)]
        append: bool,
    },
    /// List imported keys
    Keys,
    /// Scan for identifiers and resolve them against imported keys
    Scan {
        #[arg(short, long, default_value = "30")]
        seconds: u64,
    },
    /// Advertise and scan over an in-process radio
    Selftest,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Generate => cmd_generate().await,
        Commands::Derive {
            key,
            interval,
            tx_power,
        } => cmd_derive(key, interval, tx_power).await,
        Commands::Import {
            key,
            label,
            rolling_start,
            append,
        } => cmd_import(key, label, rolling_start, append).await,
        Commands::Keys => cmd_keys().await,
        Commands::Scan { seconds } => cmd_scan(seconds).await,
        Commands::Selftest => cmd_selftest().await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

fn now_interval() -> Interval {
    RotationClock::system().current_interval()
}

fn now_epoch() -> Interval {
    RotationClock::system().current_epoch()
}

async fn cmd_generate() -> Result<()> {
    let key = TemporaryKey::generate(&mut OsRng, now_interval());
    let exported = key.export();

    println!("{}", "Temporary key generated".bold());
    println!();
    println!("{}", "⚠️  Anyone holding this key can recognise your broadcasts for 24h".bright_red());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&exported).context("Failed to serialize key")?
    );

    Ok(())
}

async fn cmd_derive(key_hex: String, interval: Option<u32>, tx_power: Option<i8>) -> Result<()> {
    let config = config::Config::load()?;
    let interval = interval.map(Interval::new).unwrap_or_else(now_interval);
    let tx_power = tx_power.unwrap_or(config.service.tx_power);

    let secret = hex::decode(key_hex.trim()).context("Key is not valid hex")?;
    let key = TemporaryKey::from_slice(&secret, epoch_start(interval))?;

    let rpik = derive_proximity_identifier_key(&key);
    let aemk = derive_metadata_key(&key);
    let rpi = compute_identifier(&rpik, interval);
    let aem = encrypt_metadata(&rpi, &aemk, tx_power);
    let plain = decrypt_metadata(&aem, &rpi, &aemk);
    let metadata = AssociatedMetadata::from_plaintext(&plain);
    let payload = AdvertisementPayload {
        identifier: rpi,
        metadata: aem,
    };

    println!("{}", "Key Schedule".bold());
    println!("  Interval:      {}", interval.to_string().bright_cyan());
    println!("  Rolling start: {}", key.rolling_start());
    println!("  RPIK:          {}", rpik.to_hex().bright_yellow());
    println!("  AEMK:          {}", aemk.to_hex().bright_yellow());
    println!("  RPI:           {}", rpi.to_hex().bright_green());
    println!("  AEM:           {}", aem.to_hex().bright_green());
    println!("  Service data:  {}", hex::encode(payload.to_service_data()));
    println!(
        "  Metadata:      v{}.{} tx {} dBm ({})",
        metadata.major_version,
        metadata.minor_version,
        metadata.tx_power,
        hex::encode(plain).dimmed()
    );

    Ok(())
}

async fn cmd_import(
    key: String,
    label: Option<String>,
    rolling_start: Option<u32>,
    append: bool,
) -> Result<()> {
    let config = config::Config::load()?;
    let mut import = KeyImport::parse(&key)?
        .with_label(label.unwrap_or_else(|| config.default_label.clone()));
    if let Some(start) = rolling_start {
        import = import.with_rolling_start(Interval::new(start));
    }

    // Expanding validates the rolling start before anything is stored
    let entry = import.into_entry(now_epoch())?;
    let stored = known_keys::StoredKey {
        label: entry.label().to_string(),
        key_data: entry.key().secret_hex(),
        rolling_start_interval_number: entry.rolling_start().value(),
        added_at: chrono::Utc::now().timestamp().max(0) as u64,
    };

    let mut file = known_keys::KnownKeyFile::open(config.known_keys_file()?)?;
    if append {
        file.append(stored)?;
    } else {
        file.replace(stored)?;
    }

    println!("{} Key imported:", "✓".green());
    println!("  Label:         {}", entry.label().bright_cyan());
    println!("  Rolling start: {}", entry.rolling_start());
    println!("  Identifiers:   {}", entry.identifiers().len());
    println!("  Known keys:    {}", file.count());

    Ok(())
}

async fn cmd_keys() -> Result<()> {
    let config = config::Config::load()?;
    let file = known_keys::KnownKeyFile::open(config.known_keys_file()?)?;

    if file.count() == 0 {
        println!("{}", "No imported keys yet.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Imported Keys".bold(), file.count());
    println!();
    for key in file.list() {
        println!("  {} {}", "•".bright_green(), key.label.bright_cyan());
        println!(
            "    Rolling start: {}  Imported: {}",
            key.rolling_start_interval_number,
            format_timestamp(key.added_at).dimmed()
        );
    }

    Ok(())
}

async fn cmd_scan(seconds: u64) -> Result<()> {
    let config = config::Config::load()?;
    let file = known_keys::KnownKeyFile::open(config.known_keys_file()?)?;
    let table = file.to_table(now_epoch())?;

    let central = central::BtleplugCentral::first_adapter().await?;
    let service = Arc::new(ProximityService::new(
        Arc::new(central::UnsupportedPeripheral),
        Arc::new(central),
        Arc::new(SystemClock),
        KnownKeyStore::new(table),
        config.service.clone(),
    )?);

    println!(
        "{} Scanning for {}s ({} known keys)...",
        "✓".green(),
        seconds,
        file.count()
    );
    println!();

    let mut results = service.scan_results();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let scanner = tokio::spawn({
        let service = service.clone();
        async move {
            service
                .run_scanner(async {
                    let _ = shutdown_rx.await;
                })
                .await
        }
    });

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = results.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = results.borrow_and_update().clone();
                print_scan_table(&snapshot);
            }
        }
    }

    let _ = shutdown_tx.send(());
    service.stop().await;
    scanner
        .await
        .context("Scanner task panicked")?
        .context("Scan failed")
}

fn print_scan_table(snapshot: &[en_toolkit_core::ResolvedAdvertisement]) {
    println!("{} ({} devices)", "Nearby".bold(), snapshot.len());
    for seen in snapshot {
        let adv = &seen.advertisement;
        match &seen.matched {
            Some(m) => println!(
                "  {} {} rssi {} tx {} dBm  {}",
                "●".bright_green(),
                m.label.bright_cyan(),
                adv.rssi,
                m.metadata.tx_power,
                adv.identifier.to_hex().dimmed()
            ),
            None => println!(
                "  {} {} rssi {}",
                "○".dimmed(),
                adv.identifier.to_hex(),
                adv.rssi
            ),
        }
    }
    println!();
}

async fn cmd_selftest() -> Result<()> {
    println!("{}", "Running self-tests...".bold());
    println!();

    // Reference vector
    let secret = hex::decode("75c734c6dd1a782de7a965da5eb93125")?;
    let key = TemporaryKey::from_slice(&secret, Interval::new(2642976))?;
    let payload = AdvertisementPayload::for_interval(&key, Interval::new(2642976), 8);
    anyhow::ensure!(
        hex::encode(payload.to_service_data()) == "8be6cd371c5c891604bfbe49df84509672033874",
        "Key schedule does not match the reference vector"
    );
    println!("{} Key schedule reference vector", "✓".green());

    let air = LoopbackAir::new();
    let clock = Arc::new(SystemClock);
    let alice = ProximityService::new(
        Arc::new(air.peripheral(-50)),
        Arc::new(air.central()),
        clock.clone(),
        KnownKeyStore::default(),
        Default::default(),
    )?;
    alice.start_advertising().await?;
    if let AdvertisingState::Started { rpi_hex, .. } = &*alice.advertising_state().borrow() {
        println!("{} Advertising {}", "✓".green(), rpi_hex.dimmed());
    }

    let exported = alice.current_key().await.context("Advertiser has no key")?;
    let entry = KeyImport::from_exported(&exported)?
        .with_label("Alice")
        .into_entry(now_epoch())?;
    println!("{} Key import ({} identifiers)", "✓".green(), entry.identifiers().len());

    let bob = Arc::new(ProximityService::new(
        Arc::new(air.peripheral(-70)),
        Arc::new(air.central()),
        clock,
        KnownKeyStore::new(KnownKeyTable::from_entries(vec![entry])),
        Default::default(),
    )?);
    let mut results = bob.scan_results();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let scanner = tokio::spawn({
        let bob = bob.clone();
        async move {
            bob.run_scanner(async {
                let _ = shutdown_rx.await;
            })
            .await
        }
    });
    while air.listener_count() == 0 {
        tokio::task::yield_now().await;
    }
    air.pulse();

    tokio::time::timeout(Duration::from_secs(5), results.changed())
        .await
        .context("Scanner heard nothing")??;
    let resolved = results.borrow().first().cloned();
    let label = resolved.as_ref().and_then(|r| r.label().map(str::to_string));
    anyhow::ensure!(label.as_deref() == Some("Alice"), "Scanner did not resolve the advertiser");
    println!("{} Scan and match resolution", "✓".green());

    let _ = shutdown_tx.send(());
    bob.stop().await;
    alice.stop().await;
    scanner.await.context("Scanner task panicked")??;
    println!("{} Clean shutdown", "✓".green());

    println!();
    println!("{}", "All tests passed!".green().bold());

    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn format_timestamp(timestamp: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
