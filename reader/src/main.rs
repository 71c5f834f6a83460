use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::TERM_SIGNALS;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shmring::{Backoff, RingBuffer, RingConfig, RingError, Word};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmring-reader.toml")]
    config: String,
    /// Create (and own) the ring instead of attaching to an existing one.
    #[clap(long)]
    create: bool,
    /// Stop after this many records instead of waiting for the producers to leave.
    #[clap(short = 'n', long = "expect")]
    expect: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReaderConfig {
    ring: RingConfig,
    /// Check that sequence numbers only grow; holds for a single writer.
    verify_order: bool,
    attach_timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            ring: RingConfig::default(),
            verify_order: true,
            attach_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    records: u64,
    words: u64,
    out_of_order: u64,
    malformed: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    cfg.ring.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&stop))?;
    }

    let ring = if opts.create {
        RingBuffer::create(&cfg.ring)?
    } else {
        RingBuffer::attach_linked_wait(&cfg.ring, Duration::from_millis(cfg.attach_timeout_ms))?
    };
    info!(id = %ring.id(), capacity = ring.capacity(), owner = ring.is_owner(), "reader attached");

    let stats = run(&ring, &cfg, opts.expect, &stop)?;
    info!("{}", ring.info()?);
    ring.destroy()?;

    if stats.out_of_order > 0 || stats.malformed > 0 {
        error!(?stats, "records failed verification");
        return Err(RingError::Corrupted(format!(
            "{} out of order, {} malformed",
            stats.out_of_order, stats.malformed
        ))
        .into());
    }
    if let Some(n) = opts.expect {
        if stats.records != n {
            return Err(format!("expected {} records, read {}", n, stats.records).into());
        }
    }
    Ok(())
}

fn run(
    ring: &RingBuffer,
    cfg: &ReaderConfig,
    expect: Option<u64>,
    stop: &AtomicBool,
) -> Result<Stats, RingError> {
    let start = Instant::now();
    let mut stats = Stats::default();
    let mut backoff = Backoff::default();
    let mut out: Vec<Word> = vec![0; 64];
    let mut last_seq: Option<Word> = None;

    loop {
        if expect.map_or(false, |n| stats.records >= n) {
            break;
        }
        if stop.load(Ordering::Relaxed) {
            warn!(records = stats.records, "interrupted");
            break;
        }
        let len = match ring.dequeue_into(&mut out) {
            Ok(Some(len)) => len,
            Ok(None) => {
                if expect.is_none() && ring.is_dead()? && ring.count()? == 0 {
                    break;
                }
                backoff.snooze();
                continue;
            }
            Err(RingError::BufferTooSmall { needed, .. }) => {
                out.resize(needed, 0);
                continue;
            }
            Err(e) => return Err(e),
        };
        backoff.reset();
        stats.records += 1;
        stats.words += len as u64;

        let record = &out[..len];
        if len < 2 || record[1] as usize != len {
            stats.malformed += 1;
            continue;
        }
        if cfg.verify_order {
            if let Some(prev) = last_seq {
                if record[0] <= prev {
                    stats.out_of_order += 1;
                }
            }
            last_seq = Some(record[0]);
        }
        if stats.records % 500_000 == 0 {
            eprint!("\rTotal {} records (current: {})", stats.records, record[0]);
        }
    }

    let duration = start.elapsed();
    let rate = (stats.records as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{}K records read/s. Total {} records, {} words in {:#?}",
        (rate / 1000f64) as u64,
        stats.records,
        stats.words,
        duration
    );
    Ok(stats)
}
