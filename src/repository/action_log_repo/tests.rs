use super::ActionLogRepository;
use crate::domain::action_log::{ActionLog, ActionType};
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

fn setup_test_db() -> Arc<Mutex<Connection>> {
    let conn = Connection::open_in_memory().unwrap();
    crate::db::configure_sqlite_connection(&conn).unwrap();
    crate::db::init_schema(&conn).unwrap();
    Arc::new(Mutex::new(conn))
}

fn make_test_log(action_type: ActionType, actor: &str, ref_id: &str) -> ActionLog {
    ActionLog::new(action_type, actor, Utc::now().naive_utc())
        .with_ref("TASK", ref_id)
        .with_payload(serde_json::json!({ "task_id": ref_id }))
        .with_detail("测试日志")
}

#[test]
fn test_insert_and_find_by_id() {
    let repo = ActionLogRepository::new(setup_test_db());

    let log = make_test_log(ActionType::StartTask, "worker-1", "T1");
    let id = repo.insert(&log).unwrap();
    assert_eq!(id, log.action_id);

    let found = repo.find_by_id(&id).unwrap().unwrap();
    assert_eq!(found.action_type, "StartTask");
    assert_eq!(found.actor, "worker-1");
    assert_eq!(found.ref_id.as_deref(), Some("T1"));
    assert_eq!(found.payload_json.unwrap()["task_id"], "T1");
}

#[test]
fn test_find_by_id_not_found() {
    let repo = ActionLogRepository::new(setup_test_db());
    assert!(repo.find_by_id("missing").unwrap().is_none());
}

#[test]
fn test_find_by_ref_and_actor() {
    let repo = ActionLogRepository::new(setup_test_db());

    repo.batch_insert(vec![
        make_test_log(ActionType::StartTask, "worker-1", "T1"),
        make_test_log(ActionType::RecordOutput, "worker-1", "T1"),
        make_test_log(ActionType::StartTask, "worker-2", "T2"),
    ])
    .unwrap();

    assert_eq!(repo.find_by_ref("TASK", "T1").unwrap().len(), 2);
    assert_eq!(repo.find_by_actor("worker-2", 10).unwrap().len(), 1);
    assert_eq!(repo.count_by_action_type("StartTask").unwrap(), 2);
    assert_eq!(repo.find_by_action_type("RecordOutput", 10).unwrap().len(), 1);
}

#[test]
fn test_find_recent_limit() {
    let repo = ActionLogRepository::new(setup_test_db());
    for i in 0..5 {
        repo.insert(&make_test_log(ActionType::Receive, "wh", &format!("T{}", i)))
            .unwrap();
    }
    assert_eq!(repo.find_recent(3).unwrap().len(), 3);
}

#[test]
fn test_find_by_time_range() {
    let repo = ActionLogRepository::new(setup_test_db());

    let mut old = make_test_log(ActionType::Reserve, "planner", "T9");
    old.action_ts = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    repo.insert(&old).unwrap();
    repo.insert(&make_test_log(ActionType::Reserve, "planner", "T10"))
        .unwrap();

    let now = Utc::now().naive_utc();
    let recent = repo
        .find_by_time_range(now - Duration::hours(1), now + Duration::hours(1))
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].ref_id.as_deref(), Some("T10"));
}
