// ==========================================
// 毛绒玩具生产编排核心 - 交接单/产线占用仓储
// ==========================================
// 职责: transfer_record / line_occupancy 表
// 红线: 产线占用变更必须与交接单状态变更在同一事务内
// ==========================================

use crate::domain::handshake::{LineOccupancy, TransferRecord};
use crate::domain::quantity::Qty;
use crate::domain::types::{Department, LineState, TransferState};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{check_revision, fmt_ts, fmt_ts_opt, parse_enum, parse_ts, parse_ts_opt};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const TRANSFER_COLUMNS: &str = "transfer_id, from_task_id, to_task_id, from_department, to_department, batch_id, sent_milli, received_milli, state, block_reason, last_rejected_milli, mismatch_count, retry_of, initiated_at, locked_at, accepted_at, completed_at, blocked_at, stale_alerted_at, revision";

// ==========================================
// TransferRepository - 交接仓储
// ==========================================
pub struct TransferRepository {
    conn: Arc<Mutex<Connection>>,
}

impl TransferRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 交接单
    // ==========================================

    pub fn insert_transfer_in(conn: &Connection, t: &TransferRecord) -> RepositoryResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO transfer_record ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                TRANSFER_COLUMNS
            ),
            params![
                t.transfer_id,
                t.from_task_id,
                t.to_task_id,
                t.from_department.to_db_str(),
                t.to_department.to_db_str(),
                t.batch_id,
                t.sent_qty.milli(),
                t.received_qty.map(|q| q.milli()),
                t.state.to_db_str(),
                t.block_reason,
                t.last_rejected_qty.map(|q| q.milli()),
                t.mismatch_count,
                t.retry_of,
                fmt_ts(&t.initiated_at),
                fmt_ts_opt(&t.locked_at),
                fmt_ts_opt(&t.accepted_at),
                fmt_ts_opt(&t.completed_at),
                fmt_ts_opt(&t.blocked_at),
                fmt_ts_opt(&t.stale_alerted_at),
                t.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_transfer_in(conn: &Connection, t: &mut TransferRecord) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE transfer_record
               SET sent_milli = ?1, received_milli = ?2, state = ?3, block_reason = ?4,
                   last_rejected_milli = ?5, mismatch_count = ?6,
                   locked_at = ?7, accepted_at = ?8, completed_at = ?9, blocked_at = ?10,
                   stale_alerted_at = ?11, revision = revision + 1
               WHERE transfer_id = ?12 AND revision = ?13"#,
            params![
                t.sent_qty.milli(),
                t.received_qty.map(|q| q.milli()),
                t.state.to_db_str(),
                t.block_reason,
                t.last_rejected_qty.map(|q| q.milli()),
                t.mismatch_count,
                fmt_ts_opt(&t.locked_at),
                fmt_ts_opt(&t.accepted_at),
                fmt_ts_opt(&t.completed_at),
                fmt_ts_opt(&t.blocked_at),
                fmt_ts_opt(&t.stale_alerted_at),
                t.transfer_id,
                t.revision,
            ],
        )?;
        check_revision(
            conn,
            rows,
            "TransferRecord",
            "transfer_record",
            "transfer_id",
            &t.transfer_id,
            t.revision,
        )?;
        t.revision += 1;
        Ok(())
    }

    pub fn find_transfer_in(conn: &Connection, transfer_id: &str) -> RepositoryResult<Option<TransferRecord>> {
        let sql = format!(
            "SELECT {} FROM transfer_record WHERE transfer_id = ?1",
            TRANSFER_COLUMNS
        );
        let t = conn.query_row(&sql, params![transfer_id], map_transfer).optional()?;
        Ok(t)
    }

    pub fn get_transfer_in(conn: &Connection, transfer_id: &str) -> RepositoryResult<TransferRecord> {
        Self::find_transfer_in(conn, transfer_id)?
            .ok_or_else(|| RepositoryError::not_found("TransferRecord", transfer_id))
    }

    /// 发送工单已被交接占用的产出量
    ///
    /// 已接收/已完成按实收计，锁定中按发送量计
    pub fn held_output_in(conn: &Connection, from_task_id: &str) -> RepositoryResult<Qty> {
        let total: i64 = conn.query_row(
            r#"SELECT COALESCE(SUM(COALESCE(received_milli, sent_milli)), 0)
               FROM transfer_record
               WHERE from_task_id = ?1 AND state IN (?2, ?3, ?4)"#,
            params![
                from_task_id,
                TransferState::Locked.to_db_str(),
                TransferState::Accepted.to_db_str(),
                TransferState::Completed.to_db_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(Qty::from_milli(total))
    }

    /// 同批次仍占用目标产线的其他交接数量
    pub fn count_line_holders_in(
        conn: &Connection,
        department: Department,
        batch_id: &str,
        excluding_transfer_id: &str,
    ) -> RepositoryResult<i64> {
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM transfer_record
               WHERE to_department = ?1 AND batch_id = ?2 AND transfer_id <> ?3
                 AND state IN (?4, ?5)"#,
            params![
                department.to_db_str(),
                batch_id,
                excluding_transfer_id,
                TransferState::Locked.to_db_str(),
                TransferState::Accepted.to_db_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 等待进入某产线的 BLOCKED 交接（尚未被重试）
    pub fn blocked_for_department_in(
        conn: &Connection,
        department: Department,
    ) -> RepositoryResult<Vec<TransferRecord>> {
        let sql = format!(
            r#"SELECT {} FROM transfer_record t
               WHERE t.to_department = ?1 AND t.state = ?2
                 AND NOT EXISTS (SELECT 1 FROM transfer_record r WHERE r.retry_of = t.transfer_id)
               ORDER BY t.initiated_at, t.rowid"#,
            TRANSFER_COLUMNS
                .split(", ")
                .map(|c| format!("t.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![department.to_db_str(), TransferState::Blocked.to_db_str()],
                map_transfer,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 锁定超时且尚未告警的交接
    pub fn stale_locked_in(conn: &Connection, locked_before: NaiveDateTime) -> RepositoryResult<Vec<TransferRecord>> {
        let sql = format!(
            r#"SELECT {} FROM transfer_record
               WHERE state = ?1 AND locked_at <= ?2 AND stale_alerted_at IS NULL
               ORDER BY locked_at, rowid"#,
            TRANSFER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![TransferState::Locked.to_db_str(), fmt_ts(&locked_before)],
                map_transfer,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_transfer(&self, transfer_id: &str) -> RepositoryResult<Option<TransferRecord>> {
        let conn = self.get_conn()?;
        Self::find_transfer_in(&conn, transfer_id)
    }

    /// 与工单相关的全部交接（发出或接收）
    pub fn transfers_for_task(&self, task_id: &str) -> RepositoryResult<Vec<TransferRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM transfer_record
               WHERE from_task_id = ?1 OR to_task_id = ?1
               ORDER BY initiated_at, rowid"#,
            TRANSFER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id], map_transfer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_transfers(
        &self,
        to_department: Option<Department>,
        state: Option<TransferState>,
    ) -> RepositoryResult<Vec<TransferRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM transfer_record
               WHERE (?1 IS NULL OR to_department = ?1) AND (?2 IS NULL OR state = ?2)
               ORDER BY initiated_at, rowid"#,
            TRANSFER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    to_department.map(|d| d.to_db_str()),
                    state.map(|s| s.to_db_str())
                ],
                map_transfer,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==========================================
    // 产线占用
    // ==========================================

    pub fn get_line_in(conn: &Connection, department: Department) -> RepositoryResult<LineOccupancy> {
        conn.query_row(
            "SELECT department, state, batch_id, updated_at, revision FROM line_occupancy WHERE department = ?1",
            params![department.to_db_str()],
            map_line,
        )
        .optional()?
        .ok_or_else(|| RepositoryError::not_found("LineOccupancy", department.to_db_str()))
    }

    pub fn update_line_in(conn: &Connection, line: &mut LineOccupancy) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE line_occupancy
               SET state = ?1, batch_id = ?2, updated_at = ?3, revision = revision + 1
               WHERE department = ?4 AND revision = ?5"#,
            params![
                line.state.to_db_str(),
                line.batch_id,
                fmt_ts(&line.updated_at),
                line.department.to_db_str(),
                line.revision,
            ],
        )?;
        check_revision(
            conn,
            rows,
            "LineOccupancy",
            "line_occupancy",
            "department",
            line.department.to_db_str(),
            line.revision,
        )?;
        line.revision += 1;
        Ok(())
    }

    pub fn get_line(&self, department: Department) -> RepositoryResult<LineOccupancy> {
        let conn = self.get_conn()?;
        Self::get_line_in(&conn, department)
    }

    pub fn list_lines(&self) -> RepositoryResult<Vec<LineOccupancy>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT department, state, batch_id, updated_at, revision FROM line_occupancy",
        )?;
        let mut rows = stmt
            .query_map([], map_line)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by_key(|l| l.department);
        Ok(rows)
    }
}

fn map_transfer(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let from_dept: String = row.get(3)?;
    let to_dept: String = row.get(4)?;
    let state: String = row.get(8)?;
    Ok(TransferRecord {
        transfer_id: row.get(0)?,
        from_task_id: row.get(1)?,
        to_task_id: row.get(2)?,
        from_department: parse_enum(3, &from_dept, Department::from_db_str)?,
        to_department: parse_enum(4, &to_dept, Department::from_db_str)?,
        batch_id: row.get(5)?,
        sent_qty: Qty::from_milli(row.get(6)?),
        received_qty: row.get::<_, Option<i64>>(7)?.map(Qty::from_milli),
        state: parse_enum(8, &state, TransferState::from_db_str)?,
        block_reason: row.get(9)?,
        last_rejected_qty: row.get::<_, Option<i64>>(10)?.map(Qty::from_milli),
        mismatch_count: row.get(11)?,
        retry_of: row.get(12)?,
        initiated_at: parse_ts(13, row.get(13)?)?,
        locked_at: parse_ts_opt(14, row.get(14)?)?,
        accepted_at: parse_ts_opt(15, row.get(15)?)?,
        completed_at: parse_ts_opt(16, row.get(16)?)?,
        blocked_at: parse_ts_opt(17, row.get(17)?)?,
        stale_alerted_at: parse_ts_opt(18, row.get(18)?)?,
        revision: row.get(19)?,
    })
}

fn map_line(row: &Row<'_>) -> rusqlite::Result<LineOccupancy> {
    let dept: String = row.get(0)?;
    let state: String = row.get(1)?;
    Ok(LineOccupancy {
        department: parse_enum(0, &dept, Department::from_db_str)?,
        state: parse_enum(1, &state, LineState::from_db_str)?,
        batch_id: row.get(2)?,
        updated_at: parse_ts(3, row.get(3)?)?,
        revision: row.get(4)?,
    })
}
