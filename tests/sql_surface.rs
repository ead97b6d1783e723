use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotbook::config::EngineConfig;
use slotbook::engine::BookingEngine;
use slotbook::store::MemoryStore;
use slotbook::wire::{self, SlotbookFactory};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<BookingEngine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let engine = Arc::new(BookingEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default()));
    let factory = SlotbookFactory::new(engine.clone(), "slotbook".to_string());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user("desk")
        .password("slotbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    data_rows(client.simple_query(sql).await.unwrap())
}

async fn register_student(client: &Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO students (id, name) VALUES ('{id}', '{name}')"))
        .await
        .unwrap();
    id
}

async fn open_slot(client: &Client, teacher: Ulid, date: &str, start: &str, end: &str) -> Ulid {
    let slot = rows(
        client,
        &format!(r#"INSERT INTO slots (teacher_id, date, start, "end") VALUES ('{teacher}', '{date}', '{start}', '{end}')"#),
    )
    .await;
    assert_eq!(slot.len(), 1);
    assert_eq!(slot[0].get("status"), Some("open"));
    Ulid::from_string(slot[0].get("id").unwrap()).unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reservation_closes_slot() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let (ada, bo, teacher) = (Ulid::new(), Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO students (id, name, phone) VALUES ('{ada}', 'Ada', '+15550100');
             INSERT INTO students (id, name) VALUES ('{bo}', 'Bo')"
        ))
        .await
        .unwrap();
    let student = rows(&client, &format!("SELECT * FROM students WHERE id = '{bo}'")).await;
    assert_eq!(student[0].get("name"), Some("Bo"));
    assert_eq!(student[0].get("phone"), None);

    let slot_id = open_slot(&client, teacher, "2024-03-24", "16:00", "17:00").await;
    let available = rows(&client, "SELECT * FROM available_slots WHERE date = '2024-03-24'").await;
    assert_eq!(available.len(), 1);

    let booked = rows(
        &client,
        &format!("INSERT INTO reservations (slot_id, student_ids) VALUES ('{slot_id}', '{ada},{bo}')"),
    )
    .await;
    assert_eq!(booked.len(), 2);
    assert!(booked.iter().all(|r| r.get("lesson_id").is_some() && r.get("slot_update") == Some("linked")));

    let slot = rows(&client, &format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(slot[0].get("status"), Some("closed"));
    assert!(rows(&client, "SELECT * FROM available_slots WHERE date = '2024-03-24'").await.is_empty());

    let lessons = rows(
        &client,
        &format!("SELECT * FROM lessons WHERE date = '2024-03-24' AND teacher_id = '{teacher}'"),
    )
    .await;
    assert_eq!(lessons.len(), 2);
    assert!(lessons.iter().all(|l| l.get("duration_min") == Some("60")));
}

#[tokio::test]
async fn cancelling_reopens_slot() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let (student, teacher) = (register_student(&client, "Cy").await, Ulid::new());
    let slot_id = open_slot(&client, teacher, "2024-03-25", "09:00", "10:00").await;
    let booked = rows(
        &client,
        &format!("INSERT INTO reservations (slot_id, student_ids) VALUES ('{slot_id}', '{student}')"),
    )
    .await;
    let lesson_id = booked[0].get("lesson_id").unwrap().to_string();

    client
        .batch_execute(&format!("UPDATE lessons SET status = 'cancelled' WHERE id = '{lesson_id}'"))
        .await
        .unwrap();

    let slot = rows(&client, &format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(slot[0].get("status"), Some("open"));
    assert_eq!(slot[0].get("lesson_ids"), Some(""));
}

#[tokio::test]
async fn overlapping_lesson_needs_override() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let (student, teacher) = (register_student(&client, "Di").await, Ulid::new());
    rows(
        &client,
        &format!(
            "INSERT INTO lessons (student_ids, teacher_id, date, start, duration_min) \
             VALUES ('{student}', '{teacher}', '2024-03-26', '10:00', 45)"
        ),
    )
    .await;

    let overlapping = format!(
        "INSERT INTO lessons (student_ids, teacher_id, date, start, duration_min) \
         VALUES ('{student}', '{teacher}', '2024-03-26', '10:30', 45)"
    );
    let err = client.simple_query(&overlapping).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let conflicts = rows(
        &client,
        &format!(
            r#"SELECT * FROM conflicts WHERE entity = 'lesson' AND teacher_id = '{teacher}' AND date = '2024-03-26' AND start = '10:30' AND "end" = '11:15'"#
        ),
    )
    .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get("time_range"), Some("10:00-10:45"));

    let forced = format!(
        "INSERT INTO lessons (student_ids, teacher_id, date, start, duration_min, override_by, override_reason) \
         VALUES ('{student}', '{teacher}', '2024-03-26', '10:30', 45, 'desk', 'make-up lesson')"
    );
    assert_eq!(rows(&client, &forced).await.len(), 1);

    let audit = rows(&client, "SELECT * FROM overrides WHERE operation = 'create_lesson'").await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].get("reason"), Some("make-up lesson"));
    assert_eq!(engine.overrides().len(), 1);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let teacher = Ulid::new();
    open_slot(&client, teacher, "2024-03-27", "14:00", "15:30").await;

    let found = client
        .query(
            "SELECT * FROM available_slots WHERE date = $1 AND teacher_id = $2",
            &[&"2024-03-27", &teacher.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get::<_, String>("end"), "15:30");
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.simple_query("SELECT * FROM lessons").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let missing = Ulid::new();
    let err = client
        .simple_query(&format!("SELECT * FROM slots WHERE id = '{missing}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));

    let err = client
        .simple_query(&format!("INSERT INTO students (id, name) VALUES ('{missing}', '   ')"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));
}
