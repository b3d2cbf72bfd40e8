// ==========================================
// 毛绒玩具生产编排核心 - 损耗报告/审批仓储
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::resolution::{ApprovalRequest, WasteReport};
use crate::domain::types::ApprovalStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{check_revision, fmt_ts, fmt_ts_opt, parse_enum, parse_ts, parse_ts_opt};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const APPROVAL_COLUMNS: &str = "approval_id, task_id, waste_report_id, shortfall_milli, status, requested_at, decided_at, decided_by, comment, revision";

pub struct ResolutionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ResolutionRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ===== 损耗报告 =====

    pub fn insert_waste_report_in(conn: &Connection, report: &WasteReport) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO waste_report (report_id, task_id, shortfall_milli, reject_milli, reason, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                report.report_id,
                report.task_id,
                report.shortfall_qty.milli(),
                report.reject_qty.milli(),
                report.reason,
                fmt_ts(&report.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn waste_reports_for_task(&self, task_id: &str) -> RepositoryResult<Vec<WasteReport>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT report_id, task_id, shortfall_milli, reject_milli, reason, created_at
               FROM waste_report WHERE task_id = ?1 ORDER BY created_at, rowid"#,
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(WasteReport {
                    report_id: row.get(0)?,
                    task_id: row.get(1)?,
                    shortfall_qty: Qty::from_milli(row.get(2)?),
                    reject_qty: Qty::from_milli(row.get(3)?),
                    reason: row.get(4)?,
                    created_at: parse_ts(5, row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ===== 审批请求 =====

    pub fn insert_approval_in(conn: &Connection, a: &ApprovalRequest) -> RepositoryResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO approval_request ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                APPROVAL_COLUMNS
            ),
            params![
                a.approval_id,
                a.task_id,
                a.waste_report_id,
                a.shortfall_qty.milli(),
                a.status.to_db_str(),
                fmt_ts(&a.requested_at),
                fmt_ts_opt(&a.decided_at),
                a.decided_by,
                a.comment,
                a.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_approval_in(conn: &Connection, a: &mut ApprovalRequest) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE approval_request
               SET status = ?1, decided_at = ?2, decided_by = ?3, comment = ?4, revision = revision + 1
               WHERE approval_id = ?5 AND revision = ?6"#,
            params![
                a.status.to_db_str(),
                fmt_ts_opt(&a.decided_at),
                a.decided_by,
                a.comment,
                a.approval_id,
                a.revision,
            ],
        )?;
        check_revision(
            conn,
            rows,
            "ApprovalRequest",
            "approval_request",
            "approval_id",
            &a.approval_id,
            a.revision,
        )?;
        a.revision += 1;
        Ok(())
    }

    pub fn get_approval_in(conn: &Connection, approval_id: &str) -> RepositoryResult<ApprovalRequest> {
        let sql = format!(
            "SELECT {} FROM approval_request WHERE approval_id = ?1",
            APPROVAL_COLUMNS
        );
        conn.query_row(&sql, params![approval_id], map_approval)
            .optional()?
            .ok_or_else(|| RepositoryError::not_found("ApprovalRequest", approval_id))
    }

    /// 工单当前 PENDING 的审批（至多一条）
    pub fn pending_approval_for_task_in(
        conn: &Connection,
        task_id: &str,
    ) -> RepositoryResult<Option<ApprovalRequest>> {
        let sql = format!(
            r#"SELECT {} FROM approval_request
               WHERE task_id = ?1 AND status = ?2
               ORDER BY requested_at DESC, rowid DESC LIMIT 1"#,
            APPROVAL_COLUMNS
        );
        let a = conn
            .query_row(
                &sql,
                params![task_id, ApprovalStatus::Pending.to_db_str()],
                map_approval,
            )
            .optional()?;
        Ok(a)
    }

    pub fn find_approval(&self, approval_id: &str) -> RepositoryResult<Option<ApprovalRequest>> {
        let conn = self.get_conn()?;
        match Self::get_approval_in(&conn, approval_id) {
            Ok(a) => Ok(Some(a)),
            Err(RepositoryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> RepositoryResult<Vec<ApprovalRequest>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM approval_request
               WHERE (?1 IS NULL OR status = ?1)
               ORDER BY requested_at, rowid"#,
            APPROVAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.to_db_str())], map_approval)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn map_approval(row: &Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let status: String = row.get(4)?;
    Ok(ApprovalRequest {
        approval_id: row.get(0)?,
        task_id: row.get(1)?,
        waste_report_id: row.get(2)?,
        shortfall_qty: Qty::from_milli(row.get(3)?),
        status: parse_enum(4, &status, ApprovalStatus::from_db_str)?,
        requested_at: parse_ts(5, row.get(5)?)?,
        decided_at: parse_ts_opt(6, row.get(6)?)?,
        decided_by: row.get(7)?,
        comment: row.get(8)?,
        revision: row.get(9)?,
    })
}
