use std::{io::Write, path::PathBuf};

use clap::{Parser, Subcommand};
use layerlift_client::{
    fs::fuse::FuseDaemon, tracer::collect_traces, LocalStore, ProxyClient, Session,
};
use layerlift_delta::ImageRef;
use tracing::{error, info, Level};
use url::Url;

/// Pull container images lazily from a layerlift proxy.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the proxy.
    #[arg(long, env, default_value = "http://[::1]:8090")]
    server: Url,

    /// Where content, traces and local metadata live.
    #[arg(long, env, default_value = "/var/lib/layerlift")]
    root: PathBuf,

    #[arg(long, env, default_value_t = Level::INFO)]
    log_level: Level,

    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mounts the delta between two image stacks, serving files as they arrive.
    Pull {
        /// Destination images, comma separated.
        to: String,

        /// Images already held locally, comma separated, `_` for none.
        #[arg(long, default_value = "_")]
        from: String,

        #[clap(value_name = "PATH")]
        mountpoint: PathBuf,

        /// Number of FUSE threads, bounding concurrently blocked opens.
        #[arg(long, env, default_value_t = default_threads())]
        threads: usize,

        #[arg(long, env, default_value_t = false)]
        allow_other: bool,

        /// Print the overlay mount for this upper dir (needs --work).
        #[arg(long, requires = "work")]
        upper: Option<PathBuf>,

        #[arg(long)]
        work: Option<PathBuf>,
    },
    /// Asks the proxy to precompute an image's collection.
    Prepare { image: ImageRef },
    /// Ships recorded traces to the proxy and removes them.
    Report,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(4)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let tracing_handle = layerlift_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .json(cli.json)
        .enable_progressbar()
        .build()?;

    let client = ProxyClient::new(cli.server)?;

    match cli.command {
        Commands::Pull {
            to,
            from,
            mountpoint,
            threads,
            allow_other,
            upper,
            work,
        } => {
            let from = ImageRef::parse_list(&from)?;
            let to = ImageRef::parse_list(&to)?;
            let store = LocalStore::open(cli.root).await?;

            let mut session = Session::start(&client, store.clone(), &from, &to).await?;

            let fuse_daemon = tokio::task::spawn_blocking({
                let fs = session.fs().clone();
                let mountpoint = mountpoint.clone();
                move || FuseDaemon::new(fs, mountpoint, threads, allow_other)
            })
            .await??;
            info!(mountpoint = ?mountpoint, "mounted");

            if let (Some(upper), Some(work)) = (upper, work) {
                for mount in session.mounts(&mountpoint, &upper, &work) {
                    writeln!(
                        tracing_handle.get_stdout_writer(),
                        "{} {} {}",
                        mount.kind,
                        mount.source,
                        mount.options.join(",")
                    )?;
                }
            }

            // an interrupt during the transfer still unmounts and keeps the trace
            let received = session
                .wait_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(err = %e, "unable to listen for interrupts");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            match &received {
                Ok(Some(stats)) => {
                    info!(entries = stats.entries, bytes = stats.bytes, "delta complete");
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => info!("interrupt received, unmounting…"),
                        Err(e) => error!(err = %e, "unable to listen for interrupts, unmounting"),
                    }
                }
                Ok(None) => info!("interrupted during transfer, unmounting…"),
                Err(e) => error!(err = %e, "delta failed, discarding mount"),
            }

            let unmounted = tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await;

            if let Some(path) = session.tracer().flush(&store.traces_dir()).await? {
                info!(path = ?path, "trace recorded");
            }

            unmounted??;
            received?;
        }
        Commands::Prepare { image } => {
            let answer = client.prepare(&image).await?;
            write!(tracing_handle.get_stdout_writer(), "{}", answer)?;
        }
        Commands::Report => {
            let store = LocalStore::open(cli.root).await?;
            let (traces, files) = collect_traces(&store.traces_dir()).await?;
            if traces.groups.is_empty() {
                info!("no traces to report");
                return Ok(());
            }

            let answer = client.report(&traces).await?;
            write!(tracing_handle.get_stdout_writer(), "{}", answer)?;

            for file in files {
                tokio::fs::remove_file(&file).await?;
            }
        }
    }

    Ok(())
}
