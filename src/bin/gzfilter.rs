//! gzfilter: run the cache's gzip fetch filters from the command line
//!
//! Reads a body from a file (or stdin) as if it came from a backend, runs
//! it through a fetch filter into an in-memory object, and writes the stored
//! object to stdout.
//!
//! ```text
//! gzfilter gzip   page.html > page.html.gz
//! gzfilter gunzip page.html.gz > page.html
//! gzfilter test   page.html.gz             # exit status only
//! gzfilter gzip --align 4096 --deliver page.html   # round trip via delivery
//! ```
//!
//! Logging goes to stderr and honours `RUST_LOG` (default `info`). The
//! `CACHE_GZIP_*` environment variables override the config file.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use cache_gzip::{
    BackendConnection, DeliveryFilter, Fetch, FetchFilter, FetchMode, FilterError, GzipConfig,
    InMemoryObject, ObjectStorage, Pull, ReadBackend, WriteSink,
};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Compress on fetch
    Gzip,
    /// Decompress on fetch
    Gunzip,
    /// Validate gzip data, store it unchanged
    Test,
}

impl From<Mode> for FetchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Gzip => FetchMode::Gzip,
            Mode::Gunzip => FetchMode::Gunzip,
            Mode::Test => FetchMode::TestGunzip,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "gzfilter", version, about = "Run cache gzip fetch filters over a file")]
struct Args {
    /// Fetch filter to run
    #[arg(value_enum)]
    mode: Mode,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend bytes per filter call (default: configured chunk size)
    #[arg(long)]
    chunk: Option<usize>,

    /// Insert a resumable boundary every N input bytes (gzip only)
    #[arg(long)]
    align: Option<usize>,

    /// Pipe the stored gzip object through the gunzip delivery filter
    #[arg(long)]
    deliver: bool,

    /// Print process counters as JSON to stderr when done
    #[arg(long)]
    stats: bool,

    /// Input file (default: stdin)
    input: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let result = run(&args);

    if args.stats {
        match serde_json::to_string(&cache_gzip::stats::snapshot()) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => error!(error = %e, "failed to encode stats"),
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gzfilter failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => GzipConfig::load(path)?,
        None => GzipConfig::from_env()?,
    };
    let mode = FetchMode::from(args.mode);
    if args.align.is_some() && mode != FetchMode::Gzip {
        return Err("--align only applies to gzip".into());
    }
    if args.deliver && mode == FetchMode::Gunzip {
        return Err("--deliver needs a gzip object (gzip or test mode)".into());
    }

    let mut backend: Box<dyn BackendConnection> = match &args.input {
        Some(path) => Box::new(ReadBackend::new(File::open(path)?)),
        None => Box::new(ReadBackend::new(io::stdin().lock())),
    };

    let object = fetch(mode, &config, args, backend.as_mut())?;

    let stdout = io::stdout();
    if args.deliver {
        let mut sink = WriteSink::new(stdout.lock());
        let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config)?;
        for chunk in object.chunks() {
            filter.bytes(chunk.clone(), &mut sink)?;
        }
        let teardown = filter.end(&mut sink, false)?;
        info!(bytes_out = teardown.summary.bytes_out, "delivered");
    } else if mode != FetchMode::TestGunzip {
        let mut out = stdout.lock();
        for chunk in object.chunks() {
            out.write_all(chunk)?;
        }
        out.flush()?;
    }
    Ok(())
}

/// Drive one fetch filter over the whole backend body
fn fetch(
    mode: FetchMode,
    config: &GzipConfig,
    args: &Args,
    backend: &mut dyn BackendConnection,
) -> Result<InMemoryObject, FilterError> {
    let mut fetch = Fetch::new(InMemoryObject::new(config.segment_size));
    let mut filter: FetchFilter = FetchFilter::begin(mode, config)?;
    let budget = args.align.or(args.chunk).unwrap_or(config.chunk_size).max(1);

    let pulled = loop {
        match filter.bytes(&mut fetch, backend, budget) {
            Ok(Pull::Budget) if args.align.is_some() => {
                let markers = filter.align(&mut fetch)?;
                info!(last = markers.last, "aligned");
            }
            Ok(Pull::Budget) => {}
            Ok(Pull::Eof) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(e @ FilterError::Backend(_)) = &pulled {
        // A broken backend fails the fetch
        fetch.fail(e);
    }
    filter.end(&mut fetch)?;
    pulled?;

    let object = fetch.into_object();
    if let Some(markers) = object.bit_markers() {
        info!(
            start = markers.start,
            last = markers.last,
            stop = markers.stop,
            size = object.object_len(),
            "object stored"
        );
    }
    Ok(object)
}
