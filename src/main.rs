use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use ipa_fetcher::{
    ManifestResolver, TransferEngine,
    config::Config,
    download::{HttpTransport, LinkKind, TransferFailure, build_client, classify_link},
    util::filename_from_url,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[clap(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a package from a direct URL
    Get {
        url: String,
        /// Name to store the package under, defaults to the URL's last segment
        #[arg(long)]
        filename: Option<String>,
    },
    /// Resolve an itms-services install link and download its package
    Install { link: String },
    /// Download whatever a link points at, package or install link
    Fetch { url: String },
    /// List packages in the storage directory
    List {
        #[arg(long)]
        json: bool,
    },
}

fn print_list(engine: &TransferEngine, json: bool) -> color_eyre::Result<()> {
    let snapshot = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    if snapshot.is_empty() {
        println!("No packages in {}", engine.storage_dir().display());
        return Ok(());
    }
    for record in &snapshot.active {
        println!("{}  {}  {}", record.id, record.title, record.progress_text());
    }
    for record in &snapshot.finished {
        println!("{}  {}  {}", record.id, record.title, record.size_text());
    }
    Ok(())
}

/// Prints progress until the transfer finishes, failing if it was removed
async fn follow(
    engine: &TransferEngine,
    id: Ulid,
    mut failures: broadcast::Receiver<TransferFailure>,
) -> color_eyre::Result<()> {
    let mut records = engine.subscribe();

    loop {
        let record = records
            .borrow_and_update()
            .iter()
            .find(|r| r.id == id)
            .cloned();
        match record {
            Some(record) if record.is_finished() => {
                eprintln!();
                println!(
                    "Saved {} ({}) to {}",
                    record.title,
                    record.size_text(),
                    record.destination_path.display()
                );
                return Ok(());
            }
            Some(record) => eprint!("\r{}: {}", record.title, record.progress_text()),
            None => break,
        }

        tokio::select! {
            changed = records.changed() => changed?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                engine.cancel(&id);
                eprintln!();
                return Err(eyre!("Interrupted, transfer cancelled"));
            }
        }
    }
    eprintln!();

    // The failure notice follows the removal of the record
    let failure = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match failures.recv().await {
                Ok(failure) if failure.id == id => return Some(failure),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    match failure {
        Some(failure) => Err(eyre!("Download failed: {failure}")),
        None => Err(eyre!("Download was cancelled")),
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    color_eyre::install()?;

    let cli = Cli::parse();

    let engine_config = cli.config.storage.engine_config();
    let client = build_client(&cli.config.http)?;
    let transport = HttpTransport::with_client(client.clone(), engine_config.staging_dir.clone());
    let engine = TransferEngine::new(engine_config, transport)?;
    let resolver = ManifestResolver::new(client, engine.clone());

    // Subscribe before starting so an early failure is not missed
    let failures = engine.failures();

    let id = match cli.command {
        Command::List { json } => return print_list(&engine, json),
        Command::Get { url, filename } => {
            let filename = match filename {
                Some(filename) => filename,
                None => filename_from_url(&Url::parse(&url)?),
            };
            engine.start(&url, &filename)?
        }
        Command::Install { link } => resolver.resolve_and_start(&link).await?.id,
        Command::Fetch { url } => {
            let parsed = Url::parse(&url)?;
            match classify_link(&parsed) {
                LinkKind::InstallManifest => resolver.resolve_and_start(&url).await?.id,
                LinkKind::Package => engine.start_package_url(&parsed)?.0,
                LinkKind::Other => return Err(eyre!("Not a package or install link: {url}")),
            }
        }
    };

    follow(&engine, id, failures).await
}
