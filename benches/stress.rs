use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use horizon::auth::AccessControl;
use horizon::clock::ManualClock;
use horizon::cluster::StaticClusterResources;
use horizon::config::QueueConfig;
use horizon::engine::ReservationSystem;
use horizon::model::*;
use horizon::notify::NotifyHub;

const NOW: Ms = 1_700_000_000_000;
const HOUR: Ms = HOUR_MS;
const QUEUES: usize = 8;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn setup() -> (Arc<ReservationSystem>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(NOW));
    let system = Arc::new(ReservationSystem::new(
        Arc::new(StaticClusterResources::new(ResourceVector::new(1 << 30, 1 << 20))),
        AccessControl::new(true),
        clock.clone(),
        Arc::new(NotifyHub::new()),
    ));
    let queues: Vec<QueueConfig> = (0..QUEUES)
        .map(|i| {
            QueueConfig::new(format!("q{i}"), ResourceVector::new(64 * 1024, 64))
                .with_window(30 * 24 * HOUR)
        })
        .collect();
    system.reinitialize(&queues).await.unwrap();
    println!("  created {QUEUES} queues");
    (system, clock)
}

/// Small gang job somewhere in the next week.
fn job(i: usize, interpreter: Interpreter) -> ReservationDefinition {
    let arrival = NOW + (i as Ms % 168) * HOUR;
    let request = ReservationRequest::new(ResourceVector::new(2048, 2), 4, 2, HOUR);
    ReservationDefinition::new(
        arrival,
        arrival + 6 * HOUR,
        interpreter,
        vec![request.clone(), request],
    )
}

async fn phase1_sequential(system: &ReservationSystem) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut admitted = 0;
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        if system.submit("q0", "bench", job(i, Interpreter::Order)).await.is_ok() {
            admitted += 1;
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} submits ({admitted} admitted) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("admission latency", &mut latencies);
}

async fn phase2_concurrent(system: &Arc<ReservationSystem>) {
    let n_tasks = QUEUES * 2;
    let n_per_task = 250;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let system = system.clone();
        handles.push(tokio::spawn(async move {
            let queue = format!("q{}", t % QUEUES);
            let mut admitted = 0usize;
            for j in 0..n_per_task {
                let interpreter = if j % 2 == 0 { Interpreter::All } else { Interpreter::OrderNoGap };
                if system.submit(&queue, "bench", job(j + t, interpreter)).await.is_ok() {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut admitted = 0;
    for h in handles {
        admitted += h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} submits = {total} total ({admitted} admitted) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(system: &Arc<ReservationSystem>) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let system = system.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let queue = format!("q{}", w % QUEUES);
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                if let Ok(id) = system.submit(&queue, "writer", job(i, Interpreter::Any)).await {
                    let _ = system.delete(id, "writer").await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 1000;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let system = system.clone();
        reader_handles.push(tokio::spawn(async move {
            let queue = format!("q{}", r % QUEUES);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let from = NOW + (k as Ms % 168) * HOUR;
                let t = Instant::now();
                let _ = system.total_allocation_between(&queue, from, from + 24 * HOUR).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("allocation query", &mut all_latencies);
}

async fn phase4_follower(system: &ReservationSystem, clock: &ManualClock) {
    let mut latencies = Vec::new();
    let mut expired = 0;
    for _ in 0..(7 * 24) {
        clock.advance(HOUR);
        let t = Instant::now();
        expired += system.synchronize_plans().await.expired;
        latencies.push(t.elapsed());
    }
    println!("  {expired} reservations expired over one simulated week");
    print_latency("follower step", &mut latencies);
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    runtime.block_on(async {
        println!("=== horizon stress benchmark ===\n");

        println!("[setup]");
        let (system, clock) = setup().await;

        println!("\n[phase 1] sequential admission throughput");
        phase1_sequential(&system).await;

        println!("\n[phase 2] concurrent admission across queues");
        phase2_concurrent(&system).await;

        println!("\n[phase 3] query latency under write load");
        phase3_read_under_load(&system).await;

        println!("\n[phase 4] plan follower");
        phase4_follower(&system, &clock).await;

        println!("\n=== done ===");
    });
}
