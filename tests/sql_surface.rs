use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use leavebook::engine::{Engine, EngineConfig};
use leavebook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server_at(wal_path: PathBuf) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Arc::new(Engine::open(wal_path, EngineConfig::default()).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "leavebook".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

fn temp_wal() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("leavebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("leavebook.wal")
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    start_test_server_at(temp_wal()).await
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("leavebook")
        .user("leavebook")
        .password("leavebook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

async fn file_vacation(client: &Client, member: &str, date: &str) -> String {
    let created = rows(
        client,
        &format!(
            r#"INSERT INTO requests (id, member, kind, "date") VALUES (NULL, '{member}', 'vacation', '{date}')"#
        ),
    )
    .await;
    created[0].get("id").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn register_and_list_members() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO members (name, role, vacation_balance, hour_balance) VALUES ('Ana', 'functional', 22, 40)",
        )
        .await
        .unwrap();

    let members = rows(&client, "SELECT * FROM members WHERE name = 'Ana'").await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].get("role"), Some("functional"));
    assert_eq!(members[0].get("vacation_balance"), Some("22"));
    assert_eq!(members[0].get("hour_balance"), Some("40"));

    assert!(rows(&client, "SELECT * FROM members WHERE name = 'Nobody'").await.is_empty());
}

#[tokio::test]
async fn same_role_same_day_is_flagged_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO members VALUES ('Ana', 'functional', 2, 0), ('Luis', 'functional', 2, 0)",
        )
        .await
        .unwrap();
    let ana = file_vacation(&client, "Ana", "2024-07-15").await;
    let luis = file_vacation(&client, "Luis", "2024-07-15").await;

    let first = rows(&client, &format!("INSERT INTO approvals (request_id) VALUES ('{ana}')")).await;
    assert_eq!(first[0].get("status"), Some("approved"));
    let second = rows(&client, &format!("INSERT INTO approvals (request_id) VALUES ('{luis}')")).await;
    assert_eq!(second[0].get("status"), Some("overlapping"));

    let flagged = rows(&client, "SELECT * FROM requests WHERE status = 'overlapping'").await;
    assert_eq!(flagged.len(), 2);

    let overlaps = rows(&client, "SELECT * FROM overlaps").await;
    assert_eq!(overlaps.len(), 2);
    let for_ana = overlaps.iter().find(|r| r.get("member") == Some("Ana")).unwrap();
    assert_eq!(for_ana.get("coincides_with"), Some("Luis"));

    let summary = rows(&client, "SELECT * FROM summary").await;
    for row in &summary {
        assert_eq!(row.get("vacation_balance"), Some("1"));
        assert_eq!(row.get("overlapping"), Some("1"));
    }
}

#[tokio::test]
async fn error_codes_distinguish_failures() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute("INSERT INTO members VALUES ('Luis', 'integration', 1, 4)")
        .await
        .unwrap();

    // unknown member
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO requests (id, member, kind, "date") VALUES (NULL, 'Ghost', 'vacation', '2024-07-15')"#
        )
        .await,
        "P0002"
    );
    // five hours against a balance of four
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO requests (id, member, kind, "date", hours) VALUES (NULL, 'Luis', 'hours', '2024-07-15', 5)"#
        )
        .await,
        "P0003"
    );

    let id = file_vacation(&client, "Luis", "2024-07-16").await;
    client
        .batch_execute(&format!("INSERT INTO approvals VALUES ('{id}', 'enjoy')"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO approvals VALUES ('{id}', NULL)")).await,
        "P0004"
    );
    assert_eq!(sqlstate(&client, "SELEKT nothing").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42P01");

    // the failed re-approval did not debit twice
    let luis = rows(&client, "SELECT * FROM members WHERE name = 'Luis'").await;
    assert_eq!(luis[0].get("vacation_balance"), Some("0"));
}

#[tokio::test]
async fn reject_and_delete_requests() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute("INSERT INTO members VALUES ('Eva', 'deployment', 3, 8)")
        .await
        .unwrap();
    let keep = file_vacation(&client, "Eva", "2024-08-01").await;
    let withdrawn = file_vacation(&client, "Eva", "2024-08-02").await;

    client
        .batch_execute(&format!(
            "INSERT INTO rejections (request_id, comment) VALUES ('{keep}', 'release week')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM requests WHERE id = '{withdrawn}'"))
        .await
        .unwrap();

    let left = rows(&client, "SELECT * FROM requests WHERE member = 'Eva'").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].get("status"), Some("rejected"));
    assert_eq!(left[0].get("comment"), Some("release week"));
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM requests WHERE id = '{withdrawn}'")).await,
        "P0002"
    );

    let eva = rows(&client, "SELECT * FROM members WHERE name = 'Eva'").await;
    assert_eq!(eva[0].get("vacation_balance"), Some("3"));
}

#[tokio::test]
async fn holidays_and_calendar_feed() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let holiday = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO holidays (id, "date", label, kind) VALUES ('{holiday}', '2024-12-25', 'Christmas', 'national')"#
        ))
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM holidays").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(holiday.to_string().as_str()));

    let calendar = rows(&client, r#"SELECT * FROM calendar WHERE "year" = 2024"#).await;
    let christmas = calendar
        .iter()
        .find(|r| r.get("source") == Some("holiday"))
        .unwrap();
    assert_eq!(christmas.get("title"), Some("Christmas (national)"));
    assert_eq!(christmas.get("color"), Some("yellow"));
    assert_eq!(christmas.get("text_color"), Some("black"));
    let weekends = calendar.iter().filter(|r| r.get("source") == Some("weekend")).count();
    assert_eq!(weekends, 208);

    let feed = rows(&client, r#"SELECT * FROM calendar_feed WHERE "year" = 2024"#).await;
    let json: serde_json::Value = serde_json::from_str(feed[0].get("feed").unwrap()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), calendar.len());

    client
        .batch_execute(&format!("DELETE FROM holidays WHERE id = '{holiday}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM holidays").await.is_empty());
}

#[tokio::test]
async fn holiday_insert_returns_generated_id() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let created = rows(
        &client,
        r#"INSERT INTO holidays (id, "date", label, kind) VALUES (NULL, '2024-05-01', 'Labour Day', 'national')"#,
    )
    .await;
    assert_eq!(created.len(), 1);
    let id = created[0].get("id").unwrap().to_string();

    let listed = rows(&client, "SELECT * FROM holidays").await;
    assert_eq!(listed[0].get("id"), Some(id.as_str()));

    client
        .batch_execute(&format!("DELETE FROM holidays WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM holidays").await.is_empty());
}

#[tokio::test]
async fn parameter_values_keep_dollar_signs() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute("INSERT INTO members VALUES ('Ana', 'functional', 2, 0)")
        .await
        .unwrap();
    let id = file_vacation(&client, "Ana", "2024-07-15").await;
    client
        .execute(
            "INSERT INTO rejections (request_id, comment) VALUES ($1, $2)",
            &[&id.as_str(), &"flights cost $1 extra"],
        )
        .await
        .unwrap();

    let req = rows(&client, "SELECT * FROM requests WHERE member = 'Ana'").await;
    assert_eq!(req[0].get("status"), Some("rejected"));
    assert_eq!(req[0].get("comment"), Some("flights cost $1 extra"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .execute(
            "INSERT INTO members (name, role, vacation_balance, hour_balance) VALUES ($1, $2, $3, $4)",
            &[&"O'Neil", &"integration", &"5", &"8"],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM members WHERE name = $1", &[&"O'Neil"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let name: &str = found[0].get("name");
    assert_eq!(name, "O'Neil");
}

#[tokio::test]
async fn ledger_survives_restart() {
    let wal = temp_wal();
    let (addr, engine) = start_test_server_at(wal.clone()).await;
    let client = connect(addr).await;
    client
        .batch_execute("INSERT INTO members VALUES ('Ana', 'functional', 2, 0)")
        .await
        .unwrap();
    let id = file_vacation(&client, "Ana", "2024-07-15").await;
    client
        .batch_execute(&format!("INSERT INTO approvals VALUES ('{id}')"))
        .await
        .unwrap();
    drop(client);
    drop(engine);

    let (addr, _engine) = start_test_server_at(wal).await;
    let client = connect(addr).await;
    let requests = rows(&client, "SELECT * FROM requests").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].get("id"), Some(id.as_str()));
    assert_eq!(requests[0].get("status"), Some("approved"));
    let ana = rows(&client, "SELECT * FROM members").await;
    assert_eq!(ana[0].get("vacation_balance"), Some("1"));
}
