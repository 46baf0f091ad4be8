use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use courtside::engine::AllocationPolicy;
use courtside::gate::RoleDirectory;
use courtside::model::ActorId;
use courtside::tenant::TenantManager;
use courtside::wire;

const PASSWORD: &str = "courtside";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let roles = Arc::new(RoleDirectory::with_admins([ActorId::from("admin")]));
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        roles,
        AllocationPolicy::default(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("club")
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Rows of a simple query as (column -> value) lookups.
async fn rows(client: &Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn column(row: &tokio_postgres::SimpleQueryRow, name: &str) -> String {
    row.get(name).unwrap_or_default().to_string()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

struct Venue {
    event: Ulid,
    court_a: Ulid,
    court_b: Ulid,
}

/// Event with two courts of capacity 2, created by the admin session.
async fn create_venue(admin: &Client) -> Venue {
    let venue = Venue {
        event: Ulid::new(),
        court_a: Ulid::new(),
        court_b: Ulid::new(),
    };
    admin
        .batch_execute(&format!(
            "INSERT INTO events (id, title, starts_at, location) VALUES ('{}', 'Sunday doubles', 1700000000000, 'Club')",
            venue.event
        ))
        .await
        .unwrap();
    for (court, name, order) in [(venue.court_a, "Court A", 1), (venue.court_b, "Court B", 2)] {
        admin
            .batch_execute(&format!(
                "INSERT INTO courts (id, event_id, name, capacity, is_open, sort_order) VALUES ('{court}', '{}', '{name}', 2, true, {order})",
                venue.event
            ))
            .await
            .unwrap();
    }
    venue
}

async fn register(client: &Client, venue: &Venue, court: Ulid) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO registrations (id, event_id, court_id) VALUES ('{id}', '{}', '{court}')",
            venue.event
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn full_court_waitlists_then_promotes_on_cancel() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;

    let (ana, _) = connect(addr, "ana").await;
    let (beto, _) = connect(addr, "beto").await;
    let (carla, _) = connect(addr, "carla").await;
    let ana_reg = register(&ana, &venue, venue.court_a).await;
    register(&beto, &venue, venue.court_a).await;
    let carla_reg = register(&carla, &venue, venue.court_a).await;

    let players = rows(&admin, &format!("SELECT * FROM players WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(players.len(), 2);
    let waitlist = rows(&admin, &format!("SELECT * FROM waitlist WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(waitlist.len(), 1);
    assert_eq!(column(&waitlist[0], "registration_id"), carla_reg.to_string());
    assert_eq!(column(&waitlist[0], "position"), "1");

    // Owners may not give up a confirmed seat themselves by default.
    let code = sqlstate(&ana, &format!("DELETE FROM registrations WHERE id = '{ana_reg}'")).await;
    assert_eq!(code, "42501");
    admin
        .batch_execute(&format!("DELETE FROM registrations WHERE id = '{ana_reg}'"))
        .await
        .unwrap();

    let players = rows(&admin, &format!("SELECT * FROM players WHERE event_id = '{}'", venue.event)).await;
    let names: Vec<String> = players.iter().map(|r| column(r, "name")).collect();
    assert_eq!(names, vec!["beto", "carla"]);
    let waitlist = rows(&admin, &format!("SELECT * FROM waitlist WHERE event_id = '{}'", venue.event)).await;
    assert!(waitlist.is_empty());

    let reg = rows(&admin, &format!("SELECT * FROM registrations WHERE id = '{ana_reg}'")).await;
    assert_eq!(column(&reg[0], "state"), "CANCELLED");
}

#[tokio::test]
async fn courts_report_occupancy() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let (ana, _) = connect(addr, "ana").await;
    register(&ana, &venue, venue.court_b).await;

    let courts = rows(&admin, &format!("SELECT * FROM courts WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(courts.len(), 2);
    assert_eq!(column(&courts[0], "name"), "Court A");
    assert_eq!(column(&courts[0], "available"), "2");
    assert_eq!(column(&courts[1], "occupied"), "1");
    assert_eq!(column(&courts[1], "available"), "1");
}

#[tokio::test]
async fn rejected_court_update_leaves_court_as_it_was() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;

    let code = sqlstate(
        &admin,
        &format!("UPDATE courts SET is_open = false, capacity = 0 WHERE id = '{}'", venue.court_a),
    )
    .await;
    assert_eq!(code, "22023");
    let courts = rows(&admin, &format!("SELECT * FROM courts WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(column(&courts[0], "is_open"), "t");
    assert_eq!(column(&courts[0], "capacity"), "2");

    admin
        .batch_execute(&format!(
            "UPDATE courts SET is_open = false, capacity = 4 WHERE id = '{}'",
            venue.court_a
        ))
        .await
        .unwrap();
    let courts = rows(&admin, &format!("SELECT * FROM courts WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(column(&courts[0], "is_open"), "f");
    assert_eq!(column(&courts[0], "capacity"), "4");
}

#[tokio::test]
async fn players_listed_per_court() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let (ana, _) = connect(addr, "ana").await;
    let (beto, _) = connect(addr, "beto").await;
    register(&ana, &venue, venue.court_a).await;
    register(&beto, &venue, venue.court_b).await;

    let players = rows(&admin, &format!("SELECT * FROM players WHERE court_id = '{}'", venue.court_b)).await;
    assert_eq!(players.len(), 1);
    assert_eq!(column(&players[0], "name"), "beto");
    assert_eq!(column(&players[0], "court_name"), "Court B");
}

#[tokio::test]
async fn admin_moves_player_between_courts() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let (ana, _) = connect(addr, "ana").await;
    let reg = register(&ana, &venue, venue.court_a).await;

    // Players cannot move themselves unless self-service is enabled.
    let code = sqlstate(
        &ana,
        &format!("UPDATE registrations SET court_id = '{}' WHERE id = '{reg}'", venue.court_b),
    )
    .await;
    assert_eq!(code, "42501");

    admin
        .batch_execute(&format!(
            "UPDATE registrations SET court_id = '{}' WHERE id = '{reg}'",
            venue.court_b
        ))
        .await
        .unwrap();
    let row = rows(&admin, &format!("SELECT * FROM registrations WHERE id = '{reg}'")).await;
    assert_eq!(column(&row[0], "court_id"), venue.court_b.to_string());
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let (ana, _) = connect(addr, "ana").await;

    let code = sqlstate(
        &ana,
        &format!(
            "INSERT INTO events (id, title, starts_at, location) VALUES ('{}', 'Rogue event', 1, 'Park')",
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(code, "42501");

    register(&ana, &venue, venue.court_a).await;
    let code = sqlstate(
        &ana,
        &format!(
            "INSERT INTO registrations (id, event_id, court_id) VALUES ('{}', '{}', '{}')",
            Ulid::new(),
            venue.event,
            venue.court_b
        ),
    )
    .await;
    assert_eq!(code, "23505");

    admin
        .batch_execute(&format!("UPDATE events SET status = 'CLOSED' WHERE id = '{}'", venue.event))
        .await
        .unwrap();
    let (beto, _) = connect(addr, "beto").await;
    let code = sqlstate(
        &beto,
        &format!(
            "INSERT INTO registrations (id, event_id, court_id) VALUES ('{}', '{}', '{}')",
            Ulid::new(),
            venue.event,
            venue.court_a
        ),
    )
    .await;
    assert_eq!(code, "55000");

    assert_eq!(sqlstate(&ana, "SELECT * FROM bookings").await, "42601");
    assert_eq!(
        sqlstate(&ana, &format!("DELETE FROM registrations WHERE id = '{}'", Ulid::new())).await,
        "P0002"
    );
}

#[tokio::test]
async fn finalized_events_leave_the_listing() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let other = create_venue(&admin).await;

    admin
        .batch_execute(&format!(
            "UPDATE events SET status = 'FINALIZED' WHERE id = '{}'",
            venue.event
        ))
        .await
        .unwrap();

    let events = rows(&admin, "SELECT * FROM events").await;
    let ids: Vec<String> = events.iter().map(|r| column(r, "id")).collect();
    assert_eq!(ids, vec![other.event.to_string()]);

    let one = rows(&admin, &format!("SELECT * FROM events WHERE id = '{}'", venue.event)).await;
    assert_eq!(column(&one[0], "status"), "FINALIZED");
}

#[tokio::test]
async fn guests_and_extended_protocol_inserts() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;
    let (ana, _) = connect(addr, "ana").await;

    let id = Ulid::new().to_string();
    let affected = ana
        .execute(
            "INSERT INTO guests (id, event_id, court_id, guest_name) VALUES ($1, $2, $3, $4)",
            &[
                &id,
                &venue.event.to_string(),
                &venue.court_a.to_string(),
                &"Tito",
            ],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let players = rows(&admin, &format!("SELECT * FROM players WHERE event_id = '{}'", venue.event)).await;
    assert_eq!(column(&players[0], "kind"), "GUEST");
    assert_eq!(column(&players[0], "name"), "Tito");
    assert_eq!(column(&players[0], "created_by"), "ana");
}

#[tokio::test]
async fn listen_delivers_on_next_statement() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;

    let (watcher, mut rx) = connect(addr, "watcher").await;
    watcher
        .batch_execute(&format!("LISTEN event_{}", venue.event))
        .await
        .unwrap();

    let (ana, _) = connect(addr, "ana").await;
    register(&ana, &venue, venue.court_a).await;

    // Nothing arrives until the watcher talks to the server again.
    assert!(recv_notification(&mut rx, Duration::from_millis(200)).await.is_none());
    watcher.batch_execute("SELECT * FROM events").await.unwrap();

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("event_{}", venue.event));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(payload.get("RegistrationCreated").is_some());
}

#[tokio::test]
async fn notices_only_for_subscribed_event() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let watched = create_venue(&admin).await;
    let ignored = create_venue(&admin).await;

    let (watcher, mut rx) = connect(addr, "watcher").await;
    watcher
        .batch_execute(&format!("LISTEN event_{}", watched.event))
        .await
        .unwrap();

    let (ana, _) = connect(addr, "ana").await;
    register(&ana, &ignored, ignored.court_a).await;
    watcher.batch_execute("SELECT * FROM events").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());

    register(&ana, &watched, watched.court_a).await;
    watcher.batch_execute("SELECT * FROM events").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn unlisten_stops_notices() {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, "admin").await;
    let venue = create_venue(&admin).await;

    let (watcher, mut rx) = connect(addr, "watcher").await;
    watcher
        .batch_execute(&format!("LISTEN event_{}", venue.event))
        .await
        .unwrap();
    watcher
        .batch_execute(&format!("LISTEN event_{}", venue.event))
        .await
        .unwrap();
    watcher.batch_execute("UNLISTEN *").await.unwrap();

    let (ana, _) = connect(addr, "ana").await;
    register(&ana, &venue, venue.court_a).await;
    watcher.batch_execute("SELECT * FROM events").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_on_unknown_event_fails() {
    let addr = start_test_server().await;
    let (watcher, _) = connect(addr, "watcher").await;
    assert_eq!(
        sqlstate(&watcher, &format!("LISTEN event_{}", Ulid::new())).await,
        "P0002"
    );
    assert_eq!(sqlstate(&watcher, "LISTEN court_1").await, "22023");
}
