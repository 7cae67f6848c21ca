//! # media-relay CLI
//!
//! Command-line interface for the media-relay library.
//! Drives the transfer pipeline against Telegram or the local console.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::error;

use media_relay::catalog::{parse_size_hint, MediaType};
use media_relay::{
    render_state, CatalogClient, Coordinator, DeliverySurface, RelayConfig, ShutdownPolicy,
    SourceResolver, TelegramSurface, TransferRequest, TransferState,
};

mod cli;

/// Command-line interface for media-relay
#[derive(Parser)]
#[command(name = "media-relay")]
#[command(about = "Relays media from file hosts into a chat")]
#[command(long_about = "Streams media from third-party file hosts into a chat session:
  media-relay resolve https://pixeldrain.com/u/abc123
  media-relay fetch https://pixeldrain.com/u/abc123 --title \"Big Movie\" --variant 720p
  media-relay catalog 12 --quality 720p --send
  media-relay sweep

Without TELEGRAM_BOT_TOKEN files are copied into the outbox directory.")]
#[command(version = env!("MEDIA_RELAY_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show what a URL resolves to and whether it can be streamed
    Resolve {
        url: String,
    },
    /// Download a URL and deliver it
    Fetch(FetchArgs),
    /// Browse the catalog, optionally delivering a variant
    Catalog(CatalogArgs),
    /// Remove stale files from temp storage once
    Sweep {
        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Source URL as listed by the catalog
    url: String,

    #[arg(long, default_value = "media")]
    title: String,

    #[arg(long, default_value = "original")]
    variant: String,

    /// Catalog id used for deduplication
    #[arg(long, default_value = "adhoc")]
    content_id: String,

    /// Expected size, e.g. "1.4 GB"
    #[arg(long)]
    size_hint: Option<String>,

    #[command(flatten)]
    relay: RelayArgs,
}

#[derive(Args)]
struct CatalogArgs {
    /// Item to show; lists everything when omitted
    id: Option<String>,

    #[arg(long, env = "MEDIA_RELAY_CATALOG_URL")]
    catalog_url: String,

    /// Movie quality label, e.g. 720p
    #[arg(long, conflicts_with_all = ["season", "episode"])]
    quality: Option<String>,

    #[arg(long, requires = "episode")]
    season: Option<u32>,

    #[arg(long, requires = "season")]
    episode: Option<u32>,

    /// Deliver the selected variant
    #[arg(long)]
    send: bool,

    #[command(flatten)]
    relay: RelayArgs,
}

/// Pipeline settings shared by the delivering commands
#[derive(Args)]
struct RelayArgs {
    /// Chat that receives status messages and files
    #[arg(long, env = "MEDIA_RELAY_CHAT_ID", default_value_t = 0, allow_negative_numbers = true)]
    chat: i64,

    /// Scoped temp storage directory
    #[arg(long, env = "MEDIA_RELAY_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Size ceiling, e.g. "2 GB"
    #[arg(long, env = "MEDIA_RELAY_MAX_SIZE", default_value = "2 GB")]
    max_size: String,

    /// Inline media threshold, e.g. "200 MB"
    #[arg(long, env = "MEDIA_RELAY_INLINE_THRESHOLD", default_value = "200 MB")]
    inline_threshold: String,

    #[arg(long, env = "MEDIA_RELAY_DOWNLOAD_TIMEOUT_SECS", default_value_t = 1800)]
    download_timeout_secs: u64,

    #[arg(long, env = "MEDIA_RELAY_UPLOAD_TIMEOUT_SECS", default_value_t = 1800)]
    upload_timeout_secs: u64,

    /// Seconds before delivered content is deleted
    #[arg(long, env = "MEDIA_RELAY_TTL_SECS", default_value_t = 900)]
    ttl_secs: u64,

    /// Minutes after which a temp file counts as stale
    #[arg(long, env = "MEDIA_RELAY_STALE_MINS", default_value_t = 90)]
    stale_mins: u64,

    /// Delete delivered content on exit instead of leaving it
    #[arg(long)]
    expire_on_exit: bool,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    #[arg(long, env = "TELEGRAM_API_BASE", default_value = media_relay::surface::telegram::DEFAULT_API_BASE)]
    telegram_api: String,

    /// Where the console surface puts delivered files
    #[arg(long, env = "MEDIA_RELAY_OUTBOX", default_value = "outbox")]
    outbox: PathBuf,
}

impl RelayArgs {
    fn to_config(&self) -> anyhow::Result<RelayConfig> {
        let defaults = RelayConfig::default();
        let size_ceiling = parse_size_hint(&self.max_size)
            .with_context(|| format!("invalid --max-size {:?}", self.max_size))?;
        let inline_threshold = parse_size_hint(&self.inline_threshold)
            .with_context(|| format!("invalid --inline-threshold {:?}", self.inline_threshold))?;

        let config = RelayConfig {
            temp_dir: self.temp_dir.clone().unwrap_or(defaults.temp_dir.clone()),
            size_ceiling,
            document_ceiling: size_ceiling.max(inline_threshold),
            inline_threshold,
            download_time_ceiling: Duration::from_secs(self.download_timeout_secs),
            upload_time_ceiling: Duration::from_secs(self.upload_timeout_secs),
            expiry_ttl: Duration::from_secs(self.ttl_secs),
            staleness_threshold: Duration::from_secs(self.stale_mins.saturating_mul(60)),
            shutdown_policy: if self.expire_on_exit {
                ShutdownPolicy::ExpireNow
            } else {
                ShutdownPolicy::Abandon
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    fn surface(&self) -> Arc<dyn DeliverySurface> {
        match self.telegram_token {
            Some(ref token) if !token.is_empty() => {
                log::info!("Delivering through the Telegram Bot API");
                Arc::new(TelegramSurface::with_api_base(token.clone(), self.telegram_api.clone()))
            }
            _ => {
                eprintln!("📂 No bot token, delivering into {}", self.outbox.display());
                Arc::new(cli::ConsoleSurface::new(self.outbox.clone()))
            }
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let mut logger = env_logger::Builder::from_default_env();
    logger.target(env_logger::Target::Stderr);
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    if cli.verbose {
        eprintln!("📦 media-relay v{} starting...", env!("MEDIA_RELAY_VERSION"));
    }

    match cli.command {
        Command::Resolve { url } => {
            let resolver = SourceResolver::new();
            let resolved = resolver.resolve(&url);
            println!("{resolved}");
            if resolver.classify_streamable(&resolved) {
                eprintln!("✅ streamable");
            } else {
                eprintln!("🔗 not streamable, would be offered as a link");
            }
            Ok(())
        }
        Command::Fetch(args) => {
            let size_hint = match args.size_hint {
                Some(ref text) => Some(
                    parse_size_hint(text).with_context(|| format!("invalid --size-hint {text:?}"))?,
                ),
                None => None,
            };
            let request = TransferRequest::new(
                args.relay.chat,
                args.content_id,
                args.variant,
                args.url,
                args.title,
            )
            .with_size_hint(size_hint);
            deliver(&args.relay, request).await
        }
        Command::Catalog(args) => catalog(args).await,
        Command::Sweep { relay } => {
            let config = relay.to_config()?;
            let report = media_relay::core::expiry::sweep_dir(
                &config.temp_dir,
                config.staleness_threshold,
                std::time::SystemTime::now(),
            )
            .await;
            eprintln!(
                "🧹 {}: {} removed, {} kept, {} failed",
                config.temp_dir.display(),
                report.removed,
                report.kept,
                report.failed
            );
            Ok(())
        }
    }
}

/// Runs one request through the pipeline and reports the outcome
async fn deliver(relay: &RelayArgs, request: TransferRequest) -> anyhow::Result<()> {
    let config = relay.to_config()?;
    let coordinator = Coordinator::new(config, relay.surface()).context("cannot start the pipeline")?;

    let state = coordinator.begin_transfer(request.clone()).wait().await;
    coordinator.shutdown().await;

    let summary = render_state(&request, &state);
    match state {
        TransferState::Delivered { .. } => {
            println!("{summary}");
            Ok(())
        }
        TransferState::FallbackLink { .. } => {
            println!("{summary}");
            Ok(())
        }
        TransferState::Failed { reason, .. } => {
            println!("{summary}");
            bail!("transfer failed: {reason}")
        }
        other => bail!("transfer stopped in {} state", other.name()),
    }
}

async fn catalog(args: CatalogArgs) -> anyhow::Result<()> {
    let client = CatalogClient::new(&args.catalog_url);

    let Some(ref id) = args.id else {
        for item in client.list().await? {
            println!("{:>6}  {:<5}  {}", item.id, media_type_label(item.media_type), item.title);
        }
        return Ok(());
    };

    let item = client.get(id).await?;
    let variant = match (&args.quality, args.season, args.episode) {
        (Some(quality), _, _) => item.movie_variant(quality)?,
        (None, Some(season), Some(episode)) => item.episode_variant(season, episode)?,
        _ => {
            println!("{} ({})", item.title, media_type_label(item.media_type));
            for label in item.video_links.keys() {
                println!("  quality {label}");
            }
            for (season, data) in &item.seasons {
                println!("  {season}: {} episodes", data.episodes.len());
            }
            return Ok(());
        }
    };

    println!("{} {} -> {}", item.title, variant.label, variant.url);
    if !args.send {
        return Ok(());
    }
    let request = item.transfer_request(variant, args.relay.chat);
    deliver(&args.relay, request).await
}

fn media_type_label(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Movie => "movie",
        MediaType::Tv => "tv",
        MediaType::Other => "other",
    }
}
