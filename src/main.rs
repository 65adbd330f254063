use clap::{Parser, Subcommand};
use gallery_renditions::capability::StaticCapabilities;
use gallery_renditions::clock::SystemClock;
use gallery_renditions::config::{self, PipelineConfig};
use gallery_renditions::dispatch::Dispatcher;
use gallery_renditions::gallery::{Gallery, StatusView};
use gallery_renditions::imaging::Watermark;
use gallery_renditions::output;
use gallery_renditions::storage::FsObjectStore;
use gallery_renditions::store::FileStore;
use gallery_renditions::types::IngressEvent;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once; clap needs a static str
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "gallery-renditions")]
#[command(about = "Rendition worker for client photo galleries")]
#[command(long_about = "\
Rendition worker for client photo galleries

Each upload lands in the uploads bucket as

  originals/{galleryId}/{assetId}/{filename}

and produces one event. `dispatch` reads those events as JSON lines:

  {\"bucketName\":\"uploads\",\"objectKey\":\"originals/g1/a1/IMG_1.jpg\",\"size\":48213}

and writes the renditions next to the originals:

  renditions/{galleryId}/{assetId}/{thumbnail,small,medium,large}.jpg

Events may be delivered more than once and to several workers at the same
time; redelivery of a finished asset is a no-op. The exit status is non-zero
only when an event should be redelivered.

Run 'gallery-renditions gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Worker config file (stock defaults when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Object storage root; each bucket is a subdirectory
    #[arg(long, default_value = "storage", global = true)]
    storage: PathBuf,

    /// Metadata store directory
    #[arg(long, default_value = ".gallery-state", global = true)]
    state: PathBuf,

    /// Bucket uploads arrive in
    #[arg(long, default_value = "uploads", global = true)]
    bucket: String,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process upload events, one JSON object per line
    Dispatch {
        /// Event file, or `-` for stdin
        #[arg(long, default_value = "-")]
        event: PathBuf,
    },
    /// Show an asset's processing status
    Status {
        asset_id: String,
        /// Print the JSON body served to status pollers
        #[arg(long)]
        json: bool,
    },
    /// List a gallery's assets
    List {
        gallery_id: String,
        /// Print the visible assets as JSON
        #[arg(long)]
        json: bool,
    },
    /// Return a failed asset to pending and process it again
    Requeue { asset_id: String },
    /// Delete an asset with its original and unshared renditions
    Delete { asset_id: String },
    /// Delete every asset in a gallery
    DeleteGallery { gallery_id: String },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = config::load_config(cli.config.as_deref())?;
    init_thread_pool(&config.processing);
    let objects = Arc::new(FsObjectStore::new(cli.storage.join(&cli.bucket)));
    let store = Arc::new(FileStore::open(&cli.state)?);
    let gallery = Gallery::new(store.clone(), objects.clone(), Arc::new(SystemClock), &config.dispatch);

    match cli.command {
        Command::Dispatch { event } => {
            let dispatcher = build_dispatcher(config, objects, store, &cli.bucket)?;
            run_dispatch(&dispatcher, &event)?;
        }
        Command::Status { asset_id, json } => {
            let Some(current) = gallery.asset(&asset_id)? else {
                return Err(format!("asset {asset_id} not found").into());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&StatusView::from(&current))?);
            } else {
                output::print_asset_status(&current);
            }
        }
        Command::List { gallery_id, json } => {
            if json {
                let views: Vec<StatusView> = gallery
                    .visible_assets(&gallery_id)?
                    .iter()
                    .map(StatusView::from)
                    .collect();
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                output::print_gallery_listing(&gallery_id, &gallery.all_assets(&gallery_id)?);
            }
        }
        Command::Requeue { asset_id } => {
            let dispatcher = build_dispatcher(config, objects, store, &cli.bucket)?;
            let outcome = dispatcher.requeue(&asset_id)?;
            output::print_requeue_outcome(&asset_id, &outcome);
        }
        Command::Delete { asset_id } => {
            let outcome = gallery.delete_asset(&asset_id)?;
            output::print_delete_outcome(&asset_id, &outcome);
        }
        Command::DeleteGallery { gallery_id } => {
            let deleted = gallery.delete_gallery(&gallery_id)?;
            println!("Deleted {deleted} assets from gallery {gallery_id}");
        }
        // Printed before any config is loaded.
        Command::GenConfig => {}
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the available cores: config can lower the count, not raise it.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

fn build_dispatcher(
    config: PipelineConfig,
    objects: Arc<FsObjectStore>,
    store: Arc<FileStore>,
    bucket: &str,
) -> Result<Dispatcher, Box<dyn std::error::Error>> {
    let watermark = Watermark::load(&config.watermark)?;
    if watermark.is_none() && config.capabilities.any_plan_watermarks() {
        log::warn!("a plan enables watermarking but watermark.mark_path is not set; those assets will fail");
    }
    let capabilities = Arc::new(StaticCapabilities::new(config.capabilities.clone()));
    Ok(Dispatcher::new(config, objects, store, capabilities)
        .with_bucket(bucket)
        .with_watermark(watermark))
}

/// Dispatch every event in `source`. Events that need redelivery make the
/// whole run fail after the remaining events have been processed.
fn run_dispatch(dispatcher: &Dispatcher, source: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = if source == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(BufReader::new(std::fs::File::open(source)?))
    };

    let mut redeliver = 0usize;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: IngressEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                log::error!("line {}: not an upload event: {e}", n + 1);
                continue;
            }
        };
        match dispatcher.dispatch(&event) {
            Ok(outcome) => output::print_dispatch_outcome(&outcome),
            Err(e) => {
                log::warn!("{e}; event needs redelivery");
                redeliver += 1;
            }
        }
    }

    if redeliver > 0 {
        return Err(format!("{redeliver} event(s) need redelivery").into());
    }
    Ok(())
}
