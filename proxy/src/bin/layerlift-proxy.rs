use std::num::NonZeroUsize;

use clap::Parser;
use layerlift_proxy::{metadata, upstream, AppState};
use mimalloc::MiMalloc;
use tracing::{info, Level};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Serve lazily-pullable deltas between container images.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Where layer manifests and blobs are read from.
    #[arg(long, env, default_value = "https://registry-1.docker.io")]
    registry_addr: String,

    /// Where manifests, TOCs, collections and priorities are cached.
    #[arg(long, env, default_value = "redb:///var/lib/layerlift/proxy.redb")]
    metadata_store_addr: String,

    /// Number of layer blobs kept in memory.
    #[arg(long, env, default_value = "64")]
    layer_cache_capacity: NonZeroUsize,

    /// The address to listen on.
    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,

    #[arg(long, env, default_value_t = Level::INFO)]
    log_level: Level,

    /// Log events as JSON.
    #[arg(long, env)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let _tracing_handle = layerlift_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .json(cli.json)
        .build()?;

    let source = upstream::from_addr(&cli.registry_addr)?;
    let store = metadata::from_addr(&cli.metadata_store_addr).await?;

    let state = AppState::new(source, store, cli.layer_cache_capacity);
    let app = layerlift_proxy::gen_router().with_state(state);

    let listen_address = &cli.listen_args.listen_address.unwrap_or_else(|| {
        "[::]:8090"
            .parse()
            .expect("invalid fallback listen address")
    });

    let listener = tokio_listener::Listener::bind(
        listen_address,
        &Default::default(),
        &cli.listen_args.listener_options,
    )
    .await?;

    info!(listen_address=%listen_address, "starting daemon");

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .await?;

    Ok(())
}
