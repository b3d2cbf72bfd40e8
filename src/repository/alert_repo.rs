// ==========================================
// 毛绒玩具生产编排核心 - 告警仓储
// ==========================================
// 职责: alert 表（告警发件箱，外部通知服务轮询消费）
// ==========================================

use crate::domain::alert::Alert;
use crate::domain::types::{AlertSeverity, AlertType, Department};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{fmt_ts, parse_enum, parse_ts};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};

const ALERT_COLUMNS: &str = "alert_id, alert_type, severity, department, recipients_json, ref_type, ref_id, message, payload_json, created_at, acknowledged";

/// 告警查询条件
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub alert_type: Option<AlertType>,
    pub department: Option<Department>,
    pub ref_id: Option<String>,
    pub unacknowledged_only: bool,
    pub limit: Option<i64>,
}

pub struct AlertRepository {
    conn: Arc<Mutex<Connection>>,
}

impl AlertRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub fn insert_in(conn: &Connection, alert: &Alert) -> RepositoryResult<()> {
        let recipients = serde_json::to_string(&alert.recipients).map_err(|e| {
            RepositoryError::FieldValueError {
                field: "recipients".to_string(),
                message: e.to_string(),
            }
        })?;

        conn.execute(
            &format!(
                "INSERT INTO alert ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                ALERT_COLUMNS
            ),
            params![
                alert.alert_id,
                alert.alert_type.to_db_str(),
                alert.severity.to_db_str(),
                alert.department.map(|d| d.to_db_str()),
                recipients,
                alert.ref_type,
                alert.ref_id,
                alert.message,
                alert.payload_json.as_ref().map(|v| v.to_string()),
                fmt_ts(&alert.created_at),
                alert.acknowledged,
            ],
        )?;
        Ok(())
    }

    pub fn insert(&self, alert: &Alert) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::insert_in(&conn, alert)
    }

    /// 按条件查询告警（新告警在前）
    pub fn list(&self, filter: &AlertFilter) -> RepositoryResult<Vec<Alert>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM alert
               WHERE (?1 IS NULL OR alert_type = ?1)
                 AND (?2 IS NULL OR department = ?2)
                 AND (?3 IS NULL OR ref_id = ?3)
                 AND (?4 = 0 OR acknowledged = 0)
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?5"#,
            ALERT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.alert_type.map(|t| t.to_db_str()),
                    filter.department.map(|d| d.to_db_str()),
                    filter.ref_id,
                    filter.unacknowledged_only,
                    filter.limit.unwrap_or(-1),
                ],
                map_alert,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 确认告警
    pub fn acknowledge(&self, alert_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows = conn.execute(
            "UPDATE alert SET acknowledged = 1 WHERE alert_id = ?1",
            params![alert_id],
        )?;
        if rows == 0 {
            return Err(RepositoryError::not_found("Alert", alert_id));
        }
        Ok(())
    }

    pub fn count_by_type(&self, alert_type: AlertType) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alert WHERE alert_type = ?1",
            params![alert_type.to_db_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let alert_type: String = row.get(1)?;
    let severity: String = row.get(2)?;
    let department: Option<String> = row.get(3)?;
    let recipients_json: String = row.get(4)?;
    let payload_json: Option<String> = row.get(8)?;

    let recipients: Vec<String> = serde_json::from_str(&recipients_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Alert {
        alert_id: row.get(0)?,
        alert_type: parse_enum(1, &alert_type, AlertType::from_db_str)?,
        severity: parse_enum(2, &severity, AlertSeverity::from_db_str)?,
        department: department
            .map(|d| parse_enum(3, &d, Department::from_db_str))
            .transpose()?,
        recipients,
        ref_type: row.get(5)?,
        ref_id: row.get(6)?,
        message: row.get(7)?,
        payload_json: payload_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(9, row.get(9)?)?,
        acknowledged: row.get(10)?,
    })
}
