//! # Client Benchmark Harness
//!
//! Purpose: Drive a configurable number of threads through SET/GET round-trips
//! against one shared `KVClient` and verify every value read back.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Seeded PRNG per thread for stable comparisons.
//! 2. **Shared Client**: All threads go through one pool, as an application would.
//! 3. **Self-Hosting**: Without an address the harness starts an in-process
//!    mock server, so it runs anywhere.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlite_client::{ClientConfig, KVClient, DEFAULT_PORT};
use rlite_mock::MockServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_THREADS: usize = 50;
const DEFAULT_KEYS_PER_THREAD: usize = 100;
const VALUE_SIZE: usize = 32;

struct BenchConfig {
    addr: Option<String>,
    threads: usize,
    keys_per_thread: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let addr = args.next().filter(|raw| raw != "-");
        let threads = parse_usize(args.next(), DEFAULT_THREADS).max(1);
        let keys_per_thread = parse_usize(args.next(), DEFAULT_KEYS_PER_THREAD).max(1);

        BenchConfig {
            addr,
            threads,
            keys_per_thread,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Splits `host[:port]`, defaulting the port.
fn split_addr(addr: &str) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().with_context(|| format!("invalid port in {addr}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), DEFAULT_PORT)),
    }
}

fn random_value(rng: &mut StdRng) -> String {
    (0..VALUE_SIZE)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    info!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        error!("rlite-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args();

    // Kept alive for the whole run when embedded.
    let mut _embedded = None;
    let (host, port) = match &bench.addr {
        Some(addr) => split_addr(addr)?,
        None => {
            let server = MockServer::start().context("failed to start embedded server")?;
            let endpoint = (server.host(), server.port());
            info!(addr = %server.addr(), "no address given, using embedded server");
            _embedded = Some(server);
            endpoint
        }
    };

    let mut config = ClientConfig::new(host);
    config.port = port;
    let client = Arc::new(KVClient::with_config(config)?);
    if !client.ping()? {
        bail!("server did not answer PONG");
    }

    info!(
        threads = bench.threads,
        keys_per_thread = bench.keys_per_thread,
        pool_size = client.config().pool_size,
        "starting workload"
    );

    let start = Instant::now();
    let handles = (0..bench.threads)
        .map(|worker| {
            let client = client.clone();
            let keys = bench.keys_per_thread;
            thread::spawn(move || -> Result<usize> {
                let mut rng = StdRng::seed_from_u64(0x5EED_0000 + worker as u64);
                let mut mismatches = 0;
                for index in 0..keys {
                    let key = format!("bench:{worker}:{index}");
                    let value = random_value(&mut rng);
                    client.set_str(&key, &value)?;
                    if client.get_string(&key)?.as_deref() != Some(value.as_str()) {
                        mismatches += 1;
                    }
                }
                Ok(mismatches)
            })
        })
        .collect::<Vec<_>>();

    let mut mismatches = 0;
    for handle in handles {
        match handle.join() {
            Ok(result) => mismatches += result?,
            Err(_) => bail!("worker thread panicked"),
        }
    }

    let ops = bench.threads * bench.keys_per_thread * 2;
    report("SET+GET", ops, start.elapsed());
    info!(mismatches, "done");

    if mismatches > 0 {
        bail!("{mismatches} values did not round-trip");
    }
    Ok(())
}
