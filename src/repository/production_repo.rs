// ==========================================
// 毛绒玩具生产编排核心 - 生产批次/工单仓储
// ==========================================
// 职责: production_run / task 表
// 约束: 批次与其全部工单在同一事务内创建
// ==========================================

use crate::domain::production::{ProductionRun, Task};
use crate::domain::quantity::Qty;
use crate::domain::types::{Department, RunState, TaskState};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{check_revision, fmt_ts, parse_enum, parse_ts};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const RUN_COLUMNS: &str = "run_id, article_id, recipe_version_id, batch_id, requested_milli, state, created_by, created_at, updated_at, revision";

const TASK_COLUMNS: &str = "task_id, run_id, stage_id, department, seq_no, predecessor_task_id, target_milli, input_milli, actual_output_milli, reject_milli, state, block_reason, created_at, updated_at, revision";

// ==========================================
// ProductionRepository - 批次/工单仓储
// ==========================================
pub struct ProductionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ProductionRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 批次
    // ==========================================

    pub fn insert_run_in(conn: &Connection, run: &ProductionRun) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO production_run (
                run_id, article_id, recipe_version_id, batch_id, requested_milli,
                state, created_by, created_at, updated_at, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                run.run_id,
                run.article_id,
                run.recipe_version_id,
                run.batch_id,
                run.requested_qty.milli(),
                run.state.to_db_str(),
                run.created_by,
                fmt_ts(&run.created_at),
                fmt_ts(&run.updated_at),
                run.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_run_in(conn: &Connection, run: &mut ProductionRun) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE production_run
               SET state = ?1, updated_at = ?2, revision = revision + 1
               WHERE run_id = ?3 AND revision = ?4"#,
            params![
                run.state.to_db_str(),
                fmt_ts(&run.updated_at),
                run.run_id,
                run.revision
            ],
        )?;
        check_revision(
            conn,
            rows,
            "ProductionRun",
            "production_run",
            "run_id",
            &run.run_id,
            run.revision,
        )?;
        run.revision += 1;
        Ok(())
    }

    pub fn find_run_in(conn: &Connection, run_id: &str) -> RepositoryResult<Option<ProductionRun>> {
        let sql = format!("SELECT {} FROM production_run WHERE run_id = ?1", RUN_COLUMNS);
        let run = conn.query_row(&sql, params![run_id], map_run).optional()?;
        Ok(run)
    }

    /// 按ID查询批次（不存在返回 NotFound）
    pub fn get_run_in(conn: &Connection, run_id: &str) -> RepositoryResult<ProductionRun> {
        Self::find_run_in(conn, run_id)?
            .ok_or_else(|| RepositoryError::not_found("ProductionRun", run_id))
    }

    pub fn find_run(&self, run_id: &str) -> RepositoryResult<Option<ProductionRun>> {
        let conn = self.get_conn()?;
        Self::find_run_in(&conn, run_id)
    }

    pub fn list_runs(&self, state: Option<RunState>) -> RepositoryResult<Vec<ProductionRun>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM production_run
               WHERE (?1 IS NULL OR state = ?1)
               ORDER BY created_at DESC, rowid DESC"#,
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![state.map(|s| s.to_db_str())], map_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==========================================
    // 工单
    // ==========================================

    pub fn insert_task_in(conn: &Connection, task: &Task) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO task (
                task_id, run_id, stage_id, department, seq_no, predecessor_task_id,
                target_milli, input_milli, actual_output_milli, reject_milli,
                state, block_reason, created_at, updated_at, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                task.task_id,
                task.run_id,
                task.stage_id,
                task.department.to_db_str(),
                task.seq_no,
                task.predecessor_task_id,
                task.target_qty.milli(),
                task.input_qty.milli(),
                task.actual_output_qty.milli(),
                task.reject_qty.milli(),
                task.state.to_db_str(),
                task.block_reason,
                fmt_ts(&task.created_at),
                fmt_ts(&task.updated_at),
                task.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_task_in(conn: &Connection, task: &mut Task) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE task
               SET target_milli = ?1, input_milli = ?2, actual_output_milli = ?3, reject_milli = ?4,
                   state = ?5, block_reason = ?6, updated_at = ?7, revision = revision + 1
               WHERE task_id = ?8 AND revision = ?9"#,
            params![
                task.target_qty.milli(),
                task.input_qty.milli(),
                task.actual_output_qty.milli(),
                task.reject_qty.milli(),
                task.state.to_db_str(),
                task.block_reason,
                fmt_ts(&task.updated_at),
                task.task_id,
                task.revision,
            ],
        )?;
        check_revision(conn, rows, "Task", "task", "task_id", &task.task_id, task.revision)?;
        task.revision += 1;
        Ok(())
    }

    pub fn find_task_in(conn: &Connection, task_id: &str) -> RepositoryResult<Option<Task>> {
        let sql = format!("SELECT {} FROM task WHERE task_id = ?1", TASK_COLUMNS);
        let task = conn.query_row(&sql, params![task_id], map_task).optional()?;
        Ok(task)
    }

    /// 按ID查询工单（不存在返回 NotFound）
    pub fn get_task_in(conn: &Connection, task_id: &str) -> RepositoryResult<Task> {
        Self::find_task_in(conn, task_id)?.ok_or_else(|| RepositoryError::not_found("Task", task_id))
    }

    pub fn tasks_for_run_in(conn: &Connection, run_id: &str) -> RepositoryResult<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM task WHERE run_id = ?1 ORDER BY seq_no",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], map_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 查询下道工单（predecessor 指向本工单）
    pub fn find_successor_in(conn: &Connection, task_id: &str) -> RepositoryResult<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM task WHERE predecessor_task_id = ?1",
            TASK_COLUMNS
        );
        let task = conn.query_row(&sql, params![task_id], map_task).optional()?;
        Ok(task)
    }

    pub fn find_task(&self, task_id: &str) -> RepositoryResult<Option<Task>> {
        let conn = self.get_conn()?;
        Self::find_task_in(&conn, task_id)
    }

    pub fn tasks_for_run(&self, run_id: &str) -> RepositoryResult<Vec<Task>> {
        let conn = self.get_conn()?;
        Self::tasks_for_run_in(&conn, run_id)
    }

    /// 部门工单看板（按状态过滤）
    pub fn tasks_for_department(
        &self,
        department: Department,
        state: Option<TaskState>,
    ) -> RepositoryResult<Vec<Task>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM task
               WHERE department = ?1 AND (?2 IS NULL OR state = ?2)
               ORDER BY created_at, seq_no"#,
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![department.to_db_str(), state.map(|s| s.to_db_str())],
                map_task,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<ProductionRun> {
    let state: String = row.get(5)?;
    Ok(ProductionRun {
        run_id: row.get(0)?,
        article_id: row.get(1)?,
        recipe_version_id: row.get(2)?,
        batch_id: row.get(3)?,
        requested_qty: Qty::from_milli(row.get(4)?),
        state: parse_enum(5, &state, RunState::from_db_str)?,
        created_by: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
        updated_at: parse_ts(8, row.get(8)?)?,
        revision: row.get(9)?,
    })
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let dept: String = row.get(3)?;
    let state: String = row.get(10)?;
    Ok(Task {
        task_id: row.get(0)?,
        run_id: row.get(1)?,
        stage_id: row.get(2)?,
        department: parse_enum(3, &dept, Department::from_db_str)?,
        seq_no: row.get(4)?,
        predecessor_task_id: row.get(5)?,
        target_qty: Qty::from_milli(row.get(6)?),
        input_qty: Qty::from_milli(row.get(7)?),
        actual_output_qty: Qty::from_milli(row.get(8)?),
        reject_qty: Qty::from_milli(row.get(9)?),
        state: parse_enum(10, &state, TaskState::from_db_str)?,
        block_reason: row.get(11)?,
        created_at: parse_ts(12, row.get(12)?)?,
        updated_at: parse_ts(13, row.get(13)?)?,
        revision: row.get(14)?,
    })
}
