use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};

const LOCATION: &str = "nikaia";
const SLOTS_PER_DAY: usize = 20; // 10:00-20:00, 30-minute haircut

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let password = std::env::var("CHAIRBOOK_PASSWORD").unwrap_or_else(|_| "chairbook".into());
    let mut config = Config::new();
    config.host(host).port(port).dbname("chairbook").user("admin").password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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
        println!("  {label}: no samples");
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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// Far-future dates that a previous run is unlikely to have filled.
fn fresh_dates(count: u64) -> Vec<String> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    let base = NaiveDate::from_ymd_opt(2100, 1, 1).expect("valid date") + Days::new(secs % 50_000);
    (0..count)
        .filter_map(|i| base.checked_add_days(Days::new(i)))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect()
}

fn slot(i: usize) -> String {
    let minutes = 10 * 60 + (i % SLOTS_PER_DAY) * 30;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn insert_sql(date: &str, time: &str, n: usize) -> String {
    format!(
        "INSERT INTO appointments (location_id, staff_id, date, time, service_ids, name, email, phone) \
         VALUES ('{LOCATION}', 'any', '{date}', '{time}', 'haircut', 'Bench {n}', 'bench{n}@example.com', '{n}')"
    )
}

fn is_conflict(e: &tokio_postgres::Error) -> bool {
    e.code().is_some_and(|c| c.code() == "23P01")
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let dates = fresh_dates(50);

    let mut latencies = Vec::new();
    let start = Instant::now();
    for (d, date) in dates.iter().enumerate() {
        for i in 0..SLOTS_PER_DAY {
            let t = Instant::now();
            client.batch_execute(&insert_sql(date, &slot(i), d * SLOTS_PER_DAY + i)).await.unwrap();
            latencies.push(t.elapsed());
        }
    }

    let n = latencies.len();
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task books "any" into the same day; the shop holds four per slot.
async fn phase2_contended(host: &str, port: u16) {
    let n_tasks = 16;
    let date = Arc::new(fresh_dates(1).remove(0));
    let booked = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let host = host.to_string();
        let date = date.clone();
        let booked = booked.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..SLOTS_PER_DAY {
                match client.batch_execute(&insert_sql(&date, &slot(i), task * 100 + i)).await {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(e) if is_conflict(&e) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let booked = booked.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {SLOTS_PER_DAY} slots: {booked} booked, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert!(booked <= SLOTS_PER_DAY * 4, "double booking: {booked} bookings for {} chairs", SLOTS_PER_DAY * 4);
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let dates = Arc::new(fresh_dates(200));

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let stop = stop.clone();
        let dates = dates.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let date = &dates[(w * 50 + i / SLOTS_PER_DAY) % dates.len()];
                let _ = client.batch_execute(&insert_sql(date, &slot(i), i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let dates = dates.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = &dates[(r * 20 + i) % dates.len()];
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM free_slots WHERE location_id = '{LOCATION}' AND date = '{date}' AND service_ids = 'haircut,beard'"
                    ))
                    .await
                    .unwrap();
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

    print_latency("free_slots query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for _ in 0..10 {
                client.simple_query("SELECT * FROM locations").await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!("  {n_conns} connections: {ok}/{n_conns} succeeded in {:.2}s", start.elapsed().as_secs_f64());
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CHAIRBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CHAIRBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid CHAIRBOOK_PORT");

    println!("=== chairbook stress benchmark ===");
    println!("target: {host}:{port} (built-in catalog)\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended booking on one day");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
