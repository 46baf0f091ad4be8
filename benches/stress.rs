use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use courtside::engine::{AllocationPolicy, Engine};
use courtside::gate::RoleDirectory;
use courtside::model::*;
use courtside::notify::NotifyHub;

const MAX_CAPACITY: u32 = 50;

fn admin() -> ActorId {
    ActorId::from("admin")
}

fn player(i: usize) -> ActorId {
    ActorId::new(format!("player-{i}"))
}

fn open_engine(dir: &PathBuf, name: &str) -> Arc<Engine> {
    let path = dir.join(format!("{name}.wal"));
    let roles = Arc::new(RoleDirectory::with_admins([admin()]));
    let policy = AllocationPolicy {
        lock_timeout: Duration::from_secs(30),
        owner_self_service: true,
    };
    Arc::new(
        Engine::with_policy(path, Arc::new(NotifyHub::new()), roles, policy)
            .expect("open engine"),
    )
}

/// One open event with `courts` courts of `capacity` seats each.
async fn setup_event(engine: &Engine, courts: usize, capacity: u32) -> (Ulid, Vec<Ulid>) {
    let event_id = Ulid::new();
    engine
        .create_event(event_id, "Stress night", 0, "Bench club", None, &admin())
        .await
        .unwrap();
    let mut court_ids = Vec::with_capacity(courts);
    for i in 0..courts {
        let court_id = Ulid::new();
        engine
            .add_court(
                court_id,
                event_id,
                &format!("Court {}", i + 1),
                capacity,
                true,
                i as u32 + 1,
                &admin(),
            )
            .await
            .unwrap();
        court_ids.push(court_id);
    }
    (event_id, court_ids)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(dir: &PathBuf) {
    let engine = open_engine(dir, "sequential");
    let (event_id, courts) = setup_event(&engine, 10, MAX_CAPACITY).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        engine
            .register(event_id, &player(i), courts[i % courts.len()])
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} registrations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("register latency", &mut latencies);
}

async fn phase2_last_seat_race(dir: &PathBuf) {
    let engine = open_engine(dir, "race");
    let rounds = 50;
    let contenders = 32;
    let mut confirmed_total = 0;

    let start = Instant::now();
    for round in 0..rounds {
        let (event_id, courts) = setup_event(&engine, 1, 1).await;
        let court_id = courts[0];
        let mut handles = Vec::with_capacity(contenders);
        for c in 0..contenders {
            let engine = engine.clone();
            let actor = player(round * contenders + c);
            handles.push(tokio::spawn(async move {
                engine.register(event_id, &actor, court_id).await.unwrap()
            }));
        }
        let mut confirmed = 0;
        for h in handles {
            if matches!(h.await.unwrap().state, RegistrationState::Confirmed { .. }) {
                confirmed += 1;
            }
        }
        assert_eq!(confirmed, 1, "exactly one contender takes the last seat");
        confirmed_total += confirmed;
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {contenders} contenders: {confirmed_total} seats, no oversell, {:.2}s",
        elapsed.as_secs_f64()
    );
}

async fn phase3_cancel_churn(dir: &PathBuf) {
    let engine = open_engine(dir, "churn");
    let (event_id, courts) = setup_event(&engine, 4, 4).await;

    let n_players = 200;
    let mut regs = Vec::with_capacity(n_players);
    for i in 0..n_players {
        let admission = engine
            .register(event_id, &player(i), courts[i % courts.len()])
            .await
            .unwrap();
        regs.push((player(i), admission.registration_id));
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for chunk in regs.chunks(20) {
        let engine = engine.clone();
        let chunk = chunk.to_vec();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(chunk.len());
            let mut promoted = 0;
            for (actor, reg) in chunk {
                let t = Instant::now();
                let out = engine.cancel(reg, &actor).await.unwrap();
                latencies.push(t.elapsed());
                promoted += usize::from(out.promoted.is_some());
            }
            (latencies, promoted)
        }));
    }

    let mut latencies = Vec::new();
    let mut promoted = 0;
    for h in handles {
        let (l, p) = h.await.unwrap();
        latencies.extend(l);
        promoted += p;
    }

    let snapshot = engine.snapshot(event_id).await.unwrap();
    let seated: u32 = snapshot.courts.iter().map(|c| c.occupied).sum();
    assert_eq!(seated, 0);
    assert!(snapshot.waitlist.is_empty());
    println!(
        "  {n_players} concurrent cancels, {promoted} promotions in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("cancel latency", &mut latencies);
}

async fn phase4_snapshot_under_load(dir: &PathBuf) {
    let engine = open_engine(dir, "reads");
    let (event_id, courts) = setup_event(&engine, 8, 8).await;

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        let courts = courts.clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let actor = player(w * 1_000_000 + i);
                let court = courts[i % courts.len()];
                if let Ok(admission) = engine.register(event_id, &actor, court).await {
                    let _ = engine.cancel(admission.registration_id, &actor).await;
                }
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for _ in 0..500 {
                let t = Instant::now();
                let snapshot = engine.snapshot(event_id).await.unwrap();
                latencies.push(t.elapsed());
                for court in &snapshot.courts {
                    assert!(court.occupied <= court.capacity);
                }
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in readers {
        latencies.extend(h.await.unwrap());
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("snapshot latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("courtside_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");

    println!("=== courtside stress benchmark ===");
    println!("wal dir: {}\n", dir.display());

    println!("[phase 1] sequential registration throughput");
    phase1_sequential(&dir).await;

    println!("\n[phase 2] last-seat race");
    phase2_last_seat_race(&dir).await;

    println!("\n[phase 3] concurrent cancel churn");
    phase3_cancel_churn(&dir).await;

    println!("\n[phase 4] snapshot latency under write load");
    phase4_snapshot_under_load(&dir).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\n=== benchmark complete ===");
}
