use std::time::Duration;

use serde_json::json;
use weft_events::{EventType, StreamEvent};
use weft_orchestrator::event_log::{self, EventLog, EventLogConfig, SqliteEventLog};

const RETENTION: Duration = Duration::from_secs(600);

fn patch(n: u64) -> StreamEvent {
    StreamEvent::Patch {
        patch: json!({ "op": "append", "n": n }),
    }
}

#[tokio::test]
async fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");

    {
        let log = SqliteEventLog::open(&path, RETENTION).unwrap();
        for offset in 0..3 {
            log.append("s1", offset, &patch(offset)).await.unwrap();
        }
        log.append(
            "s1",
            3,
            &StreamEvent::Done {
                html: "<main/>".into(),
            },
        )
        .await
        .unwrap();
    }

    let log = SqliteEventLog::open(&path, RETENTION).unwrap();
    assert_eq!(log.latest_offset("s1").await.unwrap(), Some(3));

    let rows = log.read_from("s1", Some(1)).await.unwrap();
    let offsets: Vec<u64> = rows.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![2, 3]);
    assert_eq!(rows[0].event, patch(2));

    let last = log.last_html_event("s1").await.unwrap().unwrap();
    assert_eq!(last.event_type, EventType::Done);
    assert!(last.created_at > 0);
}

#[tokio::test]
async fn connect_opens_sqlite_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = EventLogConfig {
        database_url: format!("sqlite://{}", dir.path().join("weft.db").display()),
        ..Default::default()
    };

    let log = event_log::connect(&config).await.unwrap();
    log.append("s1", 0, &patch(0)).await.unwrap();
    assert_eq!(log.latest_offset("s1").await.unwrap(), Some(0));
    assert!(dir.path().join("weft.db").exists());
}

#[tokio::test]
async fn sessions_are_isolated() {
    let log = SqliteEventLog::open_in_memory(RETENTION).unwrap();
    log.append("a", 0, &patch(0)).await.unwrap();
    log.append("b", 0, &patch(0)).await.unwrap();
    log.append("b", 1, &patch(1)).await.unwrap();

    assert_eq!(log.read_from("a", None).await.unwrap().len(), 1);
    assert_eq!(log.latest_offset("b").await.unwrap(), Some(1));
    assert!(log.last_html_event("b").await.unwrap().is_none());
}
