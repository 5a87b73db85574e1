//! A thin CLI caller of the map contract (`SPEC_FULL.md` §4.12):
//! parses worker/key-size/warmup/test-count knobs, builds a [`Config`],
//! constructs a [`Scheme`], and runs `num_thread` workers each doing
//! `num_warmup` untimed and `num_test` timed random-key operations.
//!
//! It does not parse YCSB workload files, do cycle-accurate timing, or
//! pin threads to CPUs — those stay out of scope, matching the
//! teacher's own `rdms-perf` binary, which is itself a thin driver
//! around `llrb`/`robt`, not a full benchmark harness.

use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;
use rand::{RngCore, SeedableRng};
use structopt::StructOpt;

use pie_engine::{Config, IndexType, IndexContract, Scheme};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

lazy_static! {
    /// `--num_thread`'s default: the host's visible core count, computed
    /// once and reused for every `Opt::from_args()` call.
    static ref DEFAULT_NUM_THREAD: String = num_cpus::get().to_string();
}

#[derive(Clone, StructOpt)]
#[structopt(name = "pie-bench")]
struct Opt {
    #[structopt(long = "key_length", default_value = "16")]
    key_length: usize,

    #[structopt(long = "num_thread", default_value = &DEFAULT_NUM_THREAD)]
    num_thread: usize,

    #[structopt(long = "num_warmup", default_value = "10000")]
    num_warmup: usize,

    #[structopt(long = "num_test", default_value = "100000")]
    num_test: usize,

    #[structopt(long = "pmem_file_size", default_value = "2")] // GiB
    pmem_file_size: usize,

    #[structopt(long = "pmem_file_path", default_value = "/tmp/pie-engine.pm")]
    pmem_file_path: String,

    #[structopt(long = "index", default_value = "CCEH")]
    index: String,
}

fn parse_index_type(s: &str) -> IndexType {
    match s.to_uppercase().as_str() {
        "EXAMPLE" => IndexType::Example,
        "CCEH" => IndexType::Cceh,
        "FASTFAIR" => IndexType::FastFair,
        "CLHT" => IndexType::Clht,
        "RHTREE" => IndexType::RHTree,
        "WORT" => IndexType::Wort,
        other => {
            log::error!("pie-bench: unknown --index {:?}, falling back to CCEH", other);
            IndexType::Cceh
        }
    }
}

fn run_worker(scheme: Arc<Scheme>, opt: Opt, thread_id: usize) -> (usize, std::time::Duration) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(thread_id as u64 ^ 0x9E3779B97F4A7C15);
    let mut key = vec![0u8; opt.key_length];

    for i in 0..opt.num_warmup {
        rng.fill_bytes(&mut key);
        let _ = scheme.upsert(&key, i as u64);
    }

    let start = Instant::now();
    for i in 0..opt.num_test {
        rng.fill_bytes(&mut key);
        let _ = scheme.upsert(&key, i as u64);
    }
    (opt.num_test, start.elapsed())
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let config = Config::default()
        .with_index_type(parse_index_type(&opt.index))
        .with_pmem_file_path(opt.pmem_file_path.clone())
        .with_pmem_file_size(opt.pmem_file_size << 30);

    log::debug!("pie-bench: starting with {:?} threads, index={}", opt.num_thread, opt.index);

    let scheme = match Scheme::new(&config) {
        Ok(scheme) => Arc::new(scheme),
        Err(e) => {
            eprintln!("pie-bench: failed to open scheme: {}", e);
            std::process::exit(1);
        }
    };

    let mut handles = Vec::with_capacity(opt.num_thread);
    for t in 0..opt.num_thread {
        let scheme = scheme.clone();
        let opt = opt.clone();
        handles.push(std::thread::spawn(move || run_worker(scheme, opt, t)));
    }

    let mut total_ops = 0usize;
    let mut max_elapsed = std::time::Duration::ZERO;
    for h in handles {
        let (ops, elapsed) = h.join().expect("worker thread panicked");
        total_ops += ops;
        max_elapsed = max_elapsed.max(elapsed);
    }

    let throughput = if max_elapsed.as_secs_f64() > 0.0 {
        total_ops as f64 / max_elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!("{}", scheme.print());
    println!(
        "total_ops={} wall_time={:?} throughput={:.0} ops/sec",
        total_ops, max_elapsed, throughput
    );
}
