use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

/// Lessons per calendar day in the generated schedules, one per hour from 08:00.
const PER_DAY: usize = 10;

async fn connect(host: &str, port: u16) -> Client {
    let password = std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user("bench")
        .password(password);

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Day and `HH:MM` of the i-th non-overlapping hour in a schedule.
fn nth_hour(base: NaiveDate, i: usize) -> (String, String) {
    let date = base + Days::new((i / PER_DAY) as u64);
    (date.to_string(), format!("{:02}:00", 8 + i % PER_DAY))
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).expect("valid base date")
}

async fn register_student(client: &Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO students (id, name) VALUES ('{id}', 'bench {id}')"))
        .await
        .unwrap();
    id
}

async fn open_slot(client: &Client, teacher: Ulid, date: &str, start: &str, end: &str) -> Ulid {
    let messages = client
        .simple_query(&format!(
            r#"INSERT INTO slots (teacher_id, date, start, "end") VALUES ('{teacher}', '{date}', '{start}', '{end}')"#
        ))
        .await
        .unwrap();
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").and_then(|id| Ulid::from_string(id).ok()),
            _ => None,
        })
        .expect("slot insert returns its row")
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (teacher, student) = (Ulid::new(), register_student(&client).await);

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let (date, time) = nth_hour(base_date(), i);
        let t = Instant::now();
        client
            .simple_query(&format!(
                "INSERT INTO lessons (student_ids, teacher_id, date, start, duration_min) \
                 VALUES ('{student}', '{teacher}', '{date}', '{time}', 60)"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} lessons in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("checked write latency", &mut latencies);
}

async fn phase2_concurrent_reservations(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 100;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let teacher = Ulid::new();
            let base = base_date() + Days::new(400);

            for j in 0..n_per_task {
                let (date, time) = nth_hour(base, j);
                let end = time.replace(":00", ":45");
                let slot = open_slot(&client, teacher, &date, &time, &end).await;
                let (a, b) = (register_student(&client).await, register_student(&client).await);
                client
                    .simple_query(&format!(
                        "INSERT INTO reservations (slot_id, student_ids) VALUES ('{slot}', '{a},{b}')"
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} teachers x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let base = base_date() + Days::new(800);

    // Readers and writers share one week so writes keep invalidating the cache
    let setup_client = connect(host, port).await;
    let teacher = Ulid::new();
    for i in 0..50 {
        let (date, time) = nth_hour(base, i);
        let end = time.replace(":00", ":30");
        open_slot(&setup_client, teacher, &date, &time, &end).await;
    }
    drop(setup_client);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let teacher = Ulid::new();
            let student = register_student(&client).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let (date, time) = nth_hour(base, i % (PER_DAY * 7));
                let _ = client
                    .simple_query(&format!(
                        "INSERT INTO lessons (student_ids, teacher_id, date, start, duration_min, override_by, override_reason) \
                         VALUES ('{student}', '{teacher}', '{date}', '{time}', 30, 'bench', 'load')"
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    let week_end = base + Days::new(6);

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM available_slots WHERE date BETWEEN '{base}' AND '{week_end}'"
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

    print_latency("available_slots query", &mut all_latencies);
}

async fn phase4_conflict_checks(host: &str, port: u16) {
    let n_conns = 50;
    let checks_per_conn = 20;
    let day = base_date().to_string();

    let start = Instant::now();
    let mut handles = Vec::new();
    let conflicted = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let day = day.clone();
        let conflicted = conflicted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..checks_per_conn {
                let hour = 8 + i % PER_DAY;
                let messages = client
                    .simple_query(&format!(
                        r#"SELECT * FROM conflicts WHERE entity = 'lesson' AND date = '{day}' AND start = '{hour:02}:30' AND "end" = '{:02}:30'"#,
                        hour + 1
                    ))
                    .await
                    .unwrap();
                if messages.iter().any(|m| matches!(m, SimpleQueryMessage::Row(_))) {
                    conflicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let total = n_conns * checks_per_conn;
    println!(
        "  {n_conns} connections x {checks_per_conn} checks: {} of {total} conflicted, {:.2}s",
        conflicted.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");

    println!("=== slotbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential checked lesson writes");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent slot reservations");
    phase2_concurrent_reservations(&host, port).await;

    println!("\n[phase 3] calendar reads under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] conflict-check storm");
    phase4_conflict_checks(&host, port).await;

    println!("\n=== benchmark complete ===");
}
