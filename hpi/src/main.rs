use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use clap::Parser;
use hpi::{ConservativeRoots, DefaultHost, Hpi, Monitor, Options, Thread};

/// Producer/consumer workload over one monitor, with periodic
/// stop-the-world pauses that collect conservative roots.
#[derive(Parser, Debug)]
struct Cli {
    #[clap(long, default_value_t = 2)]
    producers: usize,

    #[clap(long, default_value_t = 2)]
    consumers: usize,

    /// Items each producer hands over.
    #[clap(long, default_value_t = 10_000)]
    items: usize,

    #[clap(long, default_value_t = 8)]
    capacity: usize,

    /// Milliseconds between two stop-the-world pauses.
    #[clap(long, default_value_t = 20)]
    pause_interval: u64,

    #[clap(flatten)]
    options: Options,
}

static CHANNEL: Monitor = Monitor::new();
static AVAILABLE: AtomicUsize = AtomicUsize::new(0);
static CONSUMED: AtomicUsize = AtomicUsize::new(0);

fn produce(items: usize, capacity: usize) -> hpi::Result<()> {
    for _ in 0..items {
        let guard = CHANNEL.lock()?;
        while AVAILABLE.load(Ordering::Relaxed) == capacity {
            guard.wait()?;
        }
        AVAILABLE.fetch_add(1, Ordering::Relaxed);
        guard.notify_all();
    }
    Ok(())
}

fn consume(total: usize) -> hpi::Result<()> {
    loop {
        let guard = CHANNEL.lock()?;
        while AVAILABLE.load(Ordering::Relaxed) == 0 {
            if CONSUMED.load(Ordering::Relaxed) >= total {
                return Ok(());
            }
            match guard.wait_timeout(Duration::from_millis(50)) {
                Ok(()) | Err(hpi::HpiError::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
        AVAILABLE.fetch_sub(1, Ordering::Relaxed);
        CONSUMED.fetch_add(1, Ordering::Relaxed);
        guard.notify_all();
    }
}

fn main() -> hpi::Result<()> {
    env_logger::init_from_env("HPI_LOG");
    let cli = Cli::parse();

    let (hpi, main_thread) = Hpi::bootstrap_primordial(DefaultHost, cli.options.clone())?;
    let total = cli.producers * cli.items;

    let mut workers = Vec::new();
    for i in 0..cli.producers {
        let (items, capacity) = (cli.items, cli.capacity.max(1));
        workers.push(Thread::builder().name(format!("producer-{i}")).spawn(move || {
            if let Err(err) = produce(items, capacity) {
                log::error!("producer failed: {err}");
            }
        })?);
    }
    for i in 0..cli.consumers.max(1) {
        workers.push(Thread::builder().name(format!("consumer-{i}")).spawn(move || {
            if let Err(err) = consume(total) {
                log::error!("consumer failed: {err}");
            }
        })?);
    }

    let start = Instant::now();
    let mut pauses = 0;
    let mut longest = Duration::ZERO;
    while CONSUMED.load(Ordering::Relaxed) < total {
        Thread::sleep(cli.pause_interval as i64, true)?;

        let pause = Instant::now();
        // reserved up front: nothing may allocate while the world is stopped
        let mut roots =
            ConservativeRoots::with_capacity(1 << 16, |word| word % size_of::<usize>() == 0);
        {
            let world = hpi.stop_the_world()?;
            for thread in world.roots() {
                unsafe { roots.add_thread(thread) };
            }
        }
        let elapsed = pause.elapsed();
        longest = longest.max(elapsed);
        pauses += 1;
        log::debug!("pause {pauses}: {} candidate roots in {elapsed:?}", roots.len());
    }

    for info in hpi.dump_threads()? {
        println!("{info}");
    }
    for worker in &workers {
        worker.join()?;
    }
    println!(
        "moved {} items in {:?}, {pauses} pauses, longest {longest:?}",
        CONSUMED.load(Ordering::Relaxed),
        start.elapsed()
    );

    main_thread.detach()?;
    hpi.teardown()
}
