// ==========================================
// 毛绒玩具生产编排核心 - 物料台账仓储
// ==========================================
// 职责: stock_position / material_debt / reservation 表
// 红线: 余额变更只能经由 ReservationLedger，在同一事务内落库
// ==========================================

use crate::domain::ledger::{MaterialDebt, Reservation, StockPosition};
use crate::domain::quantity::Qty;
use crate::domain::types::{DebtStatus, ReservationStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{check_revision, fmt_ts, parse_enum, parse_ts};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const POSITION_COLUMNS: &str = "material_id, location_id, on_hand_milli, reserved_milli, consumed_milli, updated_at, revision";

const DEBT_COLUMNS: &str = "debt_id, material_id, location_id, source_ref, total_milli, settled_milli, status, created_at, updated_at, revision";

const RESERVATION_COLUMNS: &str = "reservation_id, task_id, material_id, location_id, reserved_milli, consumed_milli, released_milli, status, created_at, updated_at, revision";

// ==========================================
// LedgerRepository - 台账仓储
// ==========================================
pub struct LedgerRepository {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 库存头寸
    // ==========================================

    pub fn find_position_in(
        conn: &Connection,
        material_id: &str,
        location_id: &str,
    ) -> RepositoryResult<Option<StockPosition>> {
        let sql = format!(
            "SELECT {} FROM stock_position WHERE material_id = ?1 AND location_id = ?2",
            POSITION_COLUMNS
        );
        let pos = conn
            .query_row(&sql, params![material_id, location_id], map_position)
            .optional()?;
        Ok(pos)
    }

    pub fn insert_position_in(conn: &Connection, pos: &StockPosition) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO stock_position (
                material_id, location_id, on_hand_milli, reserved_milli, consumed_milli, updated_at, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                pos.material_id,
                pos.location_id,
                pos.on_hand.milli(),
                pos.reserved.milli(),
                pos.consumed.milli(),
                fmt_ts(&pos.updated_at),
                pos.revision,
            ],
        )?;
        Ok(())
    }

    /// 更新头寸（带 revision 乐观锁，成功后 revision + 1）
    pub fn update_position_in(conn: &Connection, pos: &mut StockPosition) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE stock_position
               SET on_hand_milli = ?1, reserved_milli = ?2, consumed_milli = ?3,
                   updated_at = ?4, revision = revision + 1
               WHERE material_id = ?5 AND location_id = ?6 AND revision = ?7"#,
            params![
                pos.on_hand.milli(),
                pos.reserved.milli(),
                pos.consumed.milli(),
                fmt_ts(&pos.updated_at),
                pos.material_id,
                pos.location_id,
                pos.revision,
            ],
        )?;

        if rows == 0 {
            let key = format!("{}@{}", pos.material_id, pos.location_id);
            let actual: Option<i32> = conn
                .query_row(
                    "SELECT revision FROM stock_position WHERE material_id = ?1 AND location_id = ?2",
                    params![pos.material_id, pos.location_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match actual {
                Some(actual) => RepositoryError::OptimisticLockFailure {
                    entity: "StockPosition".to_string(),
                    id: key,
                    expected: pos.revision,
                    actual,
                },
                None => RepositoryError::not_found("StockPosition", key),
            });
        }

        pos.revision += 1;
        Ok(())
    }

    pub fn positions_for_material_in(
        conn: &Connection,
        material_id: &str,
    ) -> RepositoryResult<Vec<StockPosition>> {
        let sql = format!(
            "SELECT {} FROM stock_position WHERE material_id = ?1 ORDER BY location_id",
            POSITION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![material_id], map_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_position(
        &self,
        material_id: &str,
        location_id: &str,
    ) -> RepositoryResult<Option<StockPosition>> {
        let conn = self.get_conn()?;
        Self::find_position_in(&conn, material_id, location_id)
    }

    pub fn list_positions(&self, material_id: Option<&str>) -> RepositoryResult<Vec<StockPosition>> {
        let conn = self.get_conn()?;
        match material_id {
            Some(id) => Self::positions_for_material_in(&conn, id),
            None => {
                let sql = format!(
                    "SELECT {} FROM stock_position ORDER BY material_id, location_id",
                    POSITION_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], map_position)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        }
    }

    // ==========================================
    // 物料欠账
    // ==========================================

    pub fn insert_debt_in(conn: &Connection, debt: &MaterialDebt) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO material_debt (
                debt_id, material_id, location_id, source_ref, total_milli, settled_milli,
                status, created_at, updated_at, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                debt.debt_id,
                debt.material_id,
                debt.location_id,
                debt.source_ref,
                debt.total_qty.milli(),
                debt.settled_qty.milli(),
                debt.status.to_db_str(),
                fmt_ts(&debt.created_at),
                fmt_ts(&debt.updated_at),
                debt.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_debt_in(conn: &Connection, debt: &mut MaterialDebt) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE material_debt
               SET settled_milli = ?1, status = ?2, updated_at = ?3, revision = revision + 1
               WHERE debt_id = ?4 AND revision = ?5"#,
            params![
                debt.settled_qty.milli(),
                debt.status.to_db_str(),
                fmt_ts(&debt.updated_at),
                debt.debt_id,
                debt.revision,
            ],
        )?;
        check_revision(
            conn,
            rows,
            "MaterialDebt",
            "material_debt",
            "debt_id",
            &debt.debt_id,
            debt.revision,
        )?;
        debt.revision += 1;
        Ok(())
    }

    pub fn find_debt_in(conn: &Connection, debt_id: &str) -> RepositoryResult<Option<MaterialDebt>> {
        let sql = format!("SELECT {} FROM material_debt WHERE debt_id = ?1", DEBT_COLUMNS);
        let debt = conn.query_row(&sql, params![debt_id], map_debt).optional()?;
        Ok(debt)
    }

    /// 物料的未结欠账，按产生时间先后排序（偿还顺序）
    pub fn open_debts_for_material_in(
        conn: &Connection,
        material_id: &str,
    ) -> RepositoryResult<Vec<MaterialDebt>> {
        let sql = format!(
            r#"SELECT {} FROM material_debt
               WHERE material_id = ?1 AND status IN (?2, ?3)
               ORDER BY created_at, rowid"#,
            DEBT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    material_id,
                    DebtStatus::Active.to_db_str(),
                    DebtStatus::PartiallySettled.to_db_str()
                ],
                map_debt,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 物料未偿欠账总额
    pub fn outstanding_debt_in(conn: &Connection, material_id: &str) -> RepositoryResult<Qty> {
        let total: i64 = conn.query_row(
            r#"SELECT COALESCE(SUM(total_milli - settled_milli), 0) FROM material_debt
               WHERE material_id = ?1 AND status IN (?2, ?3)"#,
            params![
                material_id,
                DebtStatus::Active.to_db_str(),
                DebtStatus::PartiallySettled.to_db_str()
            ],
            |row| row.get(0),
        )?;
        Ok(Qty::from_milli(total))
    }

    pub fn outstanding_debt(&self, material_id: &str) -> RepositoryResult<Qty> {
        let conn = self.get_conn()?;
        Self::outstanding_debt_in(&conn, material_id)
    }

    pub fn find_debt(&self, debt_id: &str) -> RepositoryResult<Option<MaterialDebt>> {
        let conn = self.get_conn()?;
        Self::find_debt_in(&conn, debt_id)
    }

    /// 查询欠账列表
    ///
    /// # 参数
    /// - material_id: 按物料过滤（None 表示全部）
    /// - open_only: 仅返回未结欠账
    pub fn list_debts(
        &self,
        material_id: Option<&str>,
        open_only: bool,
    ) -> RepositoryResult<Vec<MaterialDebt>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM material_debt
               WHERE (?1 IS NULL OR material_id = ?1)
                 AND (?2 = 0 OR status IN (?3, ?4))
               ORDER BY created_at, rowid"#,
            DEBT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    material_id,
                    open_only,
                    DebtStatus::Active.to_db_str(),
                    DebtStatus::PartiallySettled.to_db_str()
                ],
                map_debt,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==========================================
    // 工单预留
    // ==========================================

    pub fn insert_reservation_in(conn: &Connection, r: &Reservation) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO reservation (
                reservation_id, task_id, material_id, location_id, reserved_milli,
                consumed_milli, released_milli, status, created_at, updated_at, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                r.reservation_id,
                r.task_id,
                r.material_id,
                r.location_id,
                r.reserved_qty.milli(),
                r.consumed_qty.milli(),
                r.released_qty.milli(),
                r.status.to_db_str(),
                fmt_ts(&r.created_at),
                fmt_ts(&r.updated_at),
                r.revision,
            ],
        )?;
        Ok(())
    }

    pub fn update_reservation_in(conn: &Connection, r: &mut Reservation) -> RepositoryResult<()> {
        let rows = conn.execute(
            r#"UPDATE reservation
               SET reserved_milli = ?1, consumed_milli = ?2, released_milli = ?3, status = ?4,
                   updated_at = ?5, revision = revision + 1
               WHERE reservation_id = ?6 AND revision = ?7"#,
            params![
                r.reserved_qty.milli(),
                r.consumed_qty.milli(),
                r.released_qty.milli(),
                r.status.to_db_str(),
                fmt_ts(&r.updated_at),
                r.reservation_id,
                r.revision,
            ],
        )?;
        check_revision(
            conn,
            rows,
            "Reservation",
            "reservation",
            "reservation_id",
            &r.reservation_id,
            r.revision,
        )?;
        r.revision += 1;
        Ok(())
    }

    /// 工单的 ACTIVE 预留（按创建先后）
    pub fn active_reservations_for_task_in(
        conn: &Connection,
        task_id: &str,
    ) -> RepositoryResult<Vec<Reservation>> {
        let sql = format!(
            r#"SELECT {} FROM reservation
               WHERE task_id = ?1 AND status = ?2
               ORDER BY created_at, rowid"#,
            RESERVATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![task_id, ReservationStatus::Active.to_db_str()],
                map_reservation,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 工单历史上是否已做过预留（任意状态）
    pub fn count_reservations_for_task_in(conn: &Connection, task_id: &str) -> RepositoryResult<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reservation WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn reservations_for_task(&self, task_id: &str) -> RepositoryResult<Vec<Reservation>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM reservation WHERE task_id = ?1 ORDER BY created_at, rowid",
            RESERVATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id], map_reservation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ==========================================
// 行映射
// ==========================================

fn map_position(row: &Row<'_>) -> rusqlite::Result<StockPosition> {
    Ok(StockPosition {
        material_id: row.get(0)?,
        location_id: row.get(1)?,
        on_hand: Qty::from_milli(row.get(2)?),
        reserved: Qty::from_milli(row.get(3)?),
        consumed: Qty::from_milli(row.get(4)?),
        updated_at: parse_ts(5, row.get(5)?)?,
        revision: row.get(6)?,
    })
}

fn map_debt(row: &Row<'_>) -> rusqlite::Result<MaterialDebt> {
    let status: String = row.get(6)?;
    Ok(MaterialDebt {
        debt_id: row.get(0)?,
        material_id: row.get(1)?,
        location_id: row.get(2)?,
        source_ref: row.get(3)?,
        total_qty: Qty::from_milli(row.get(4)?),
        settled_qty: Qty::from_milli(row.get(5)?),
        status: parse_enum(6, &status, DebtStatus::from_db_str)?,
        created_at: parse_ts(7, row.get(7)?)?,
        updated_at: parse_ts(8, row.get(8)?)?,
        revision: row.get(9)?,
    })
}

fn map_reservation(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    let status: String = row.get(7)?;
    Ok(Reservation {
        reservation_id: row.get(0)?,
        task_id: row.get(1)?,
        material_id: row.get(2)?,
        location_id: row.get(3)?,
        reserved_qty: Qty::from_milli(row.get(4)?),
        consumed_qty: Qty::from_milli(row.get(5)?),
        released_qty: Qty::from_milli(row.get(6)?),
        status: parse_enum(7, &status, ReservationStatus::from_db_str)?,
        created_at: parse_ts(8, row.get(8)?)?,
        updated_at: parse_ts(9, row.get(9)?)?,
        revision: row.get(10)?,
    })
}
