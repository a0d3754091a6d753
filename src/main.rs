use clap::{Parser, Subcommand};
use sharedcache::{inspect_file, CacheOptions, SharedReader, URI_PREFIX};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sharedcache", version = "1.0.0", about = "Shared file cache CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a shared: URI through the cache
    Fetch {
        /// URI, e.g. shared:file:///path/to/resource
        uri: String,
        /// Directory holding the .cache/.spacemap pairs
        #[arg(short, long)]
        cache_dir: PathBuf,
        /// log2 of the block size (9..=30); an existing space map wins
        #[arg(short, long, default_value = "15")]
        block_shift: u16,
        /// Microseconds to wait on blocks another process is fetching
        #[arg(short, long, default_value = "0")]
        timeout: u64,
        /// Read from the cache but never write to it
        #[arg(long)]
        read_only: bool,
        /// Give up on blocks whose fetch failed before
        #[arg(long)]
        no_retry: bool,
        /// Byte offset to start reading at
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Byte count to read (default: to EOF)
        #[arg(short, long)]
        length: Option<u64>,
        /// Write the bytes here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode a .spacemap file and report its block states
    Inspect {
        spacemap: PathBuf,
        /// Emit the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the cache file paths a URI maps to
    Paths {
        uri: String,
        #[arg(short, long)]
        cache_dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {

        // ── Fetch ────────────────────────────────────────────────────────────
        Commands::Fetch {
            uri, cache_dir, block_shift, timeout, read_only, no_retry,
            offset, length, output,
        } => {
            let opts = CacheOptions {
                cache_dir,
                block_shift,
                read_only,
                cache_timeout_us: timeout,
                retry_errors: !no_retry,
            };
            let mut reader = SharedReader::open(&uri, opts)?;
            if offset > 0 {
                reader.seek(SeekFrom::Start(offset))?;
            }

            let mut sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(std::fs::File::create(path)?),
                None => Box::new(std::io::stdout().lock()),
            };

            let mut remaining = length.unwrap_or(u64::MAX);
            let mut buf = vec![0u8; reader.block_size()];
            let mut total = 0u64;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n])?;
                total += n as u64;
                remaining -= n as u64;
            }
            sink.flush()?;

            let stats = reader.stats();
            eprintln!(
                "Fetched {total} B  ({} hits, {} misses, block size {} B)",
                stats.hits, stats.misses, reader.block_size(),
            );
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { spacemap, json } => {
            let report = inspect_file(&spacemap)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
                println!("  version:     {}", report.version);
                match 1u64.checked_shl(u32::from(report.block_shift)) {
                    Some(bs) => println!("  block size:  {bs} B (shift {})", report.block_shift),
                    None => println!("  block size:  invalid (shift {})", report.block_shift),
                }
                match report.file_size {
                    0 => println!("  resource:    size unknown"),
                    n => println!("  resource:    {n} B"),
                }
                println!("  uri hash:    {}", report.uri_hash);
                println!(
                    "  states:      {} none, {} cached, {} pending, {} failed, {} invalid",
                    report.none, report.cached, report.pending, report.failed, report.invalid,
                );
            }
        }

        // ── Paths ────────────────────────────────────────────────────────────
        Commands::Paths { uri, cache_dir } => {
            let inner = uri.strip_prefix(URI_PREFIX).unwrap_or(&uri);
            let hash = sharedcache::hash_uri(inner);
            let (cache, map) = sharedcache::cache_paths(&cache_dir, &hash);
            println!("content:   {}", cache.display());
            println!("space map: {}", map.display());
        }
    }

    Ok(())
}
