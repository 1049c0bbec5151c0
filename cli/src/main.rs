use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use casfs_castore::provider::Registry;
use casfs_castore::record::RecordWriter;
use casfs_castore::{CasReader, Error, NodeKind, Source, SriDigest, Tree};
use casfs_serve::Server;

mod listen;

/// Unify tree-shaped data sources behind one streaming contract, and
/// serve their contents from a content-addressable store.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs. `RUST_LOG`
    /// according to tracing_subscriber's EnvFilter always has priority.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serves a content addressable storage (CAS).
    Cas {
        /// Type of the CAS backend: a provider name (`memory`), or a
        /// backend URL (`memory://`).
        #[arg(long, env = "CASFS_BACKEND_TYPE")]
        backend_type: String,

        /// CAS backend specific options, as key=value.
        #[arg(long = "backend-option")]
        backend_options: Vec<String>,

        /// Addresses (tcp or unix domain socket URLs) to listen on for
        /// HTTP requests.
        #[arg(long = "http-listen")]
        http_listen: Vec<String>,

        /// Addresses (tcp or unix domain socket URLs) to listen on for
        /// record streams.
        #[arg(long = "record-listen")]
        record_listen: Vec<String>,

        /// Files to read records from. Use "-" for stdin.
        #[arg(long = "record-from")]
        record_from: Vec<String>,
    },

    /// Converts a source file system into a sink format.
    Convert {
        /// Path or reference to the source.
        #[arg(long)]
        source: String,

        /// Type of the source.
        #[arg(long)]
        source_type: String,

        /// Path or reference to the sink.
        #[arg(long)]
        sink: String,

        /// Type of the sink.
        #[arg(long)]
        sink_type: String,
    },

    /// Flattens a source file system into JSON.
    Json {
        /// Path or reference to the source.
        #[arg(long)]
        source: String,

        /// Type of the source.
        #[arg(long)]
        source_type: String,

        /// Path to write the listing to. Stdout if unset.
        #[arg(long)]
        out: Option<String>,

        /// Also write every visited blob as a record stream to this
        /// file.
        #[arg(long)]
        record_to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            cli.log_level
                .unwrap_or(Level::INFO)
                .to_string(),
        )
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("casfs: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), Error> {
    let registry = &*casfs_fs::REGISTRY;
    match command {
        Commands::Cas {
            backend_type,
            backend_options,
            http_listen,
            record_listen,
            record_from,
        } => {
            run_cas(
                registry,
                &backend_type,
                &backend_options,
                &http_listen,
                &record_listen,
                &record_from,
            )
            .await
        }
        Commands::Convert {
            source,
            source_type,
            sink,
            sink_type,
        } => run_convert(registry, &source, &source_type, &sink, &sink_type).await,
        Commands::Json {
            source,
            source_type,
            out,
            record_to,
        } => run_json(registry, &source, &source_type, out.as_deref(), record_to.as_deref()).await,
    }
}

async fn run_cas(
    registry: &Registry,
    backend_type: &str,
    backend_options: &[String],
    http_listen: &[String],
    record_listen: &[String],
    record_from: &[String],
) -> Result<(), Error> {
    let blob_service = if backend_type.contains("://") {
        if !backend_options.is_empty() {
            return Err(Error::InvalidOptions(backend_options.to_vec()));
        }
        casfs_castore::blobservice::from_addr(backend_type)?
    } else {
        let provider = registry.get(backend_type).ok_or_else(|| {
            Error::Unsupported(format!("unknown CAS backend type {backend_type:?}"))
        })?;
        let mut builder = provider.cas_builder()?;
        for option in backend_options {
            let Some((key, value)) = option.split_once('=') else {
                return Err(Error::InvalidOptions(vec![option.clone()]));
            };
            builder.set(key, value);
        }
        builder.build().await?
    };

    let mut server = Server::new(blob_service);

    for url in http_listen {
        let config = listen::parse_listen_url(url)?;
        server.add_http_listener(listen::bind(&config).await?);
        info!(address = %config.address, "listening for HTTP requests");
    }
    for url in record_listen {
        let config = listen::parse_listen_url(url)?;
        server.add_record_listener(listen::bind(&config).await?);
        info!(address = %config.address, "listening for record streams");
    }
    for from in record_from {
        if from == "-" {
            server.add_record_reader(tokio::io::stdin());
        } else {
            server.add_record_reader(tokio::fs::File::open(from).await?);
        }
    }

    let stop = server.stop_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.cancel();
    });

    server.serve(CancellationToken::new()).await
}

async fn run_convert(
    registry: &Registry,
    source_ref: &str,
    source_type: &str,
    sink_ref: &str,
    sink_type: &str,
) -> Result<(), Error> {
    let mut source = build_source(registry, source_type, source_ref).await?;
    let tree = Tree::from_source(source.as_mut()).await?;

    let provider = registry
        .get(sink_type)
        .ok_or_else(|| Error::Unsupported(format!("unknown sink type {sink_type:?}")))?;
    let mut builder = provider.sink_builder()?;
    builder.sink_ref(sink_ref);
    let mut sink = builder.build().await?;

    let result = sink.consume(&tree, source.as_ref()).await;
    source.close_wait().await?;
    result
}

async fn run_json(
    registry: &Registry,
    source_ref: &str,
    source_type: &str,
    out: Option<&str>,
    record_to: Option<&str>,
) -> Result<(), Error> {
    let mut source = build_source(registry, source_type, source_ref).await?;
    let tree = Tree::from_source(source.as_mut()).await?;

    let files: Vec<_> = tree.stats().collect();
    let encoded = serde_json::to_string(&files)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    match out {
        Some(path) => std::fs::write(path, encoded + "\n")?,
        None => println!("{encoded}"),
    }

    if let Some(path) = record_to {
        record_blobs(&tree, source.as_ref(), path).await?;
    }

    source.close_wait().await
}

/// Streams every regular node's contents as record frames into a file,
/// ready to be replayed against a CAS server.
async fn record_blobs(tree: &Tree, cas: &dyn CasReader, path: &str) -> Result<(), Error> {
    let mut writer = RecordWriter::new(tokio::fs::File::create(path).await?);
    let mut seen = std::collections::HashSet::new();
    for node in &tree.nodes {
        if node.stat.kind != NodeKind::Regular {
            continue;
        }
        let digest: SriDigest = node.stat.payload.parse()?;
        if !seen.insert(digest.clone()) {
            continue;
        }
        let mut reader = cas.open(&digest).await?;
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        writer.send(&digest, &contents).await?;
    }
    writer.flush().await
}

async fn build_source(
    registry: &Registry,
    source_type: &str,
    source_ref: &str,
) -> Result<Box<dyn Source>, Error> {
    let provider = registry
        .get(source_type)
        .ok_or_else(|| Error::Unsupported(format!("unknown source type {source_type:?}")))?;
    let mut builder = provider.source_builder()?;
    builder.source_ref(source_ref);
    builder.build().await
}
