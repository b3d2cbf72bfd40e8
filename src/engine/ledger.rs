// ==========================================
// 毛绒玩具生产编排核心 - 物料预留台账引擎
// ==========================================
// 职责: Reserve / Consume / Receive / Release / WriteOff
// 不变量（按物料、按库位均成立）: reserved − on_hand ≤ 该库位未偿欠账
// 红线:
// - 预留/消耗永不因库存不足失败，超出部分记欠账
// - 唯一硬错误: 物料或库位不存在
// - 同一物料的全部库位与欠账共用 material:{id} 键锁
// ==========================================

use crate::domain::alert::{Alert, SUPERVISOR_ROLE, WAREHOUSE_ROLE};
use crate::domain::ledger::{MaterialDebt, Reservation, StockPosition};
use crate::domain::quantity::Qty;
use crate::domain::recipe::Material;
use crate::domain::types::{AlertSeverity, AlertType, DebtStatus, ReservationStatus};
use crate::engine::alerts::{AlertOutbox, OptionalAlertPublisher};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::keyed_lock::{material_key, KeyedLock};
use crate::repository::ledger_repo::LedgerRepository;
use crate::repository::masterdata_repo::MasterdataRepository;
use crate::repository::{RepositoryError, UnitOfWork};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ==========================================
// 操作结果
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveOutcome {
    pub ok: bool,
    pub debt_created: bool,
    pub debt_id: Option<String>,
    pub debt_qty: Qty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub from_reserved: Qty,
    pub from_free_stock: Qty,
    pub debt_created: bool,
    pub debt_id: Option<String>,
    pub debt_qty: Qty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtSettlement {
    pub debt_id: String,
    pub settled_qty: Qty,
    pub status: DebtStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveOutcome {
    pub received: Qty,
    pub settlements: Vec<DebtSettlement>,
    /// 偿还欠账后计入可用库存的部分
    pub credited_to_stock: Qty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub released: Qty,
    pub debt_settled: Qty,
}

// ==========================================
// 事务内台账操作（调用方已持有 material 键锁）
// ==========================================

fn require_positive(qty: Qty, what: &str) -> EngineResult<()> {
    if !qty.is_positive() {
        return Err(EngineError::InvalidInput(format!("{}数量必须大于0: {}", what, qty)));
    }
    require_within_limit(qty, what)
}

/// 数量绝对值不得超过 `Qty::MAX`
pub(crate) fn require_within_limit(qty: Qty, what: &str) -> EngineResult<()> {
    if qty.exceeds_limit() {
        return Err(EngineError::InvalidInput(format!(
            "{}数量超出上限 {}: {}",
            what,
            Qty::MAX,
            qty
        )));
    }
    Ok(())
}

/// 校验物料与库位存在
pub(crate) fn ensure_known_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
) -> EngineResult<Material> {
    let material = MasterdataRepository::find_material_in(conn, material_id)?;
    let location_known = MasterdataRepository::location_exists_in(conn, location_id)?;
    match material {
        Some(m) if location_known => Ok(m),
        _ => Err(EngineError::UnknownStockPosition {
            material_id: material_id.to_string(),
            location_id: location_id.to_string(),
        }),
    }
}

/// 读取头寸；首次使用时建立零库存头寸
fn load_position_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
    now: NaiveDateTime,
) -> EngineResult<StockPosition> {
    if let Some(pos) = LedgerRepository::find_position_in(conn, material_id, location_id)? {
        return Ok(pos);
    }
    let pos = StockPosition::empty(material_id, location_id, now);
    LedgerRepository::insert_position_in(conn, &pos)?;
    Ok(pos)
}

fn open_debt_in(
    conn: &Connection,
    pos: &StockPosition,
    qty: Qty,
    source_ref: Option<&str>,
    trigger: &str,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<MaterialDebt> {
    let debt = MaterialDebt {
        debt_id: uuid::Uuid::new_v4().to_string(),
        material_id: pos.material_id.clone(),
        location_id: pos.location_id.clone(),
        source_ref: source_ref.map(str::to_string),
        total_qty: qty,
        settled_qty: Qty::ZERO,
        status: DebtStatus::Active,
        created_at: now,
        updated_at: now,
        revision: 0,
    };
    LedgerRepository::insert_debt_in(conn, &debt)?;

    tracing::warn!(
        debt_id = %debt.debt_id,
        material_id = %debt.material_id,
        location_id = %debt.location_id,
        qty = %qty,
        trigger,
        "库存不足，记录物料欠账"
    );

    outbox.raise_in(
        conn,
        Alert::new(
            AlertType::DebtCreated,
            AlertSeverity::Warning,
            "DEBT",
            &debt.debt_id,
            format!(
                "物料 {} @ {} {}超出账面库存，欠账 {}",
                debt.material_id, debt.location_id, trigger, qty
            ),
            now,
        )
        .with_recipient(WAREHOUSE_ROLE)
        .with_recipient(SUPERVISOR_ROLE)
        .with_payload(json!({
            "material_id": debt.material_id,
            "location_id": debt.location_id,
            "qty": qty,
            "source_ref": debt.source_ref,
            "trigger": trigger,
        })),
    )?;
    Ok(debt)
}

/// 预留：reserved 增加；超出账面库存的部分记为新欠账
pub(crate) fn reserve_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    source_ref: Option<&str>,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<ReserveOutcome> {
    require_positive(qty, "预留")?;
    ensure_known_in(conn, material_id, location_id)?;

    let mut pos = load_position_in(conn, material_id, location_id, now)?;
    let uncovered_before = (pos.reserved - pos.on_hand).non_negative();
    pos.reserved += qty;
    let uncovered_after = (pos.reserved - pos.on_hand).non_negative();
    let excess = uncovered_after - uncovered_before;
    pos.updated_at = now;
    LedgerRepository::update_position_in(conn, &mut pos)?;

    let debt = if excess.is_positive() {
        Some(open_debt_in(conn, &pos, excess, source_ref, "预留", now, outbox)?)
    } else {
        None
    };

    tracing::debug!(material_id, location_id, qty = %qty, debt = %excess, "预留完成");

    Ok(ReserveOutcome {
        ok: true,
        debt_created: debt.is_some(),
        debt_id: debt.map(|d| d.debt_id),
        debt_qty: excess,
    })
}

/// 消耗：先冲减预留，超出部分先用自由库存，再不足记欠账
///
/// # 参数
/// - reserved_limit: 工单维度可冲减的预留上限（None 表示按头寸预留）
#[allow(clippy::too_many_arguments)]
pub(crate) fn consume_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    reserved_limit: Option<Qty>,
    source_ref: Option<&str>,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<ConsumeOutcome> {
    require_positive(qty, "消耗")?;
    ensure_known_in(conn, material_id, location_id)?;

    let mut pos = load_position_in(conn, material_id, location_id, now)?;

    let mut from_reserved = qty.min(pos.reserved.non_negative());
    if let Some(limit) = reserved_limit {
        from_reserved = from_reserved.min(limit.non_negative());
    }
    pos.reserved -= from_reserved;
    pos.on_hand -= from_reserved;

    let excess = qty - from_reserved;
    let free = (pos.on_hand - pos.reserved).non_negative();
    let from_free = excess.min(free);
    let debt_qty = excess - from_free;
    pos.on_hand -= excess;
    pos.consumed += qty;
    pos.updated_at = now;
    LedgerRepository::update_position_in(conn, &mut pos)?;

    let debt = if debt_qty.is_positive() {
        Some(open_debt_in(conn, &pos, debt_qty, source_ref, "消耗", now, outbox)?)
    } else {
        None
    };

    Ok(ConsumeOutcome {
        from_reserved,
        from_free_stock: from_free,
        debt_created: debt.is_some(),
        debt_id: debt.map(|d| d.debt_id),
        debt_qty,
    })
}

/// 入库：on_hand 增加，按先到先还偿还该物料的欠账，剩余计入可用库存
///
/// 偿还其他库位的欠账时，偿还量记到欠账所在库位的账面库存
pub(crate) fn receive_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    now: NaiveDateTime,
) -> EngineResult<ReceiveOutcome> {
    require_positive(qty, "入库")?;
    ensure_known_in(conn, material_id, location_id)?;

    let mut touched: BTreeMap<String, StockPosition> = BTreeMap::new();
    let mut receiving = load_position_in(conn, material_id, location_id, now)?;
    receiving.on_hand += qty;
    touched.insert(location_id.to_string(), receiving);

    let mut remaining = qty;
    let mut settlements = Vec::new();
    for mut debt in LedgerRepository::open_debts_for_material_in(conn, material_id)? {
        if !remaining.is_positive() {
            break;
        }
        let applied = debt.settle(remaining, now);
        if !applied.is_positive() {
            continue;
        }
        remaining -= applied;
        LedgerRepository::update_debt_in(conn, &mut debt)?;

        if debt.location_id != location_id {
            if let Some(recv) = touched.get_mut(location_id) {
                recv.on_hand -= applied;
            }
            if !touched.contains_key(&debt.location_id) {
                let pos = load_position_in(conn, material_id, &debt.location_id, now)?;
                touched.insert(debt.location_id.clone(), pos);
            }
            if let Some(target) = touched.get_mut(&debt.location_id) {
                target.on_hand += applied;
            }
        }

        tracing::info!(
            debt_id = %debt.debt_id,
            settled = %applied,
            status = %debt.status,
            "入库偿还物料欠账"
        );
        settlements.push(DebtSettlement {
            debt_id: debt.debt_id.clone(),
            settled_qty: applied,
            status: debt.status,
        });
    }

    for pos in touched.values_mut() {
        pos.updated_at = now;
        LedgerRepository::update_position_in(conn, pos)?;
    }

    Ok(ReceiveOutcome {
        received: qty,
        settlements,
        credited_to_stock: remaining,
    })
}

/// 释放预留；被释放的超额预留对应的欠账按后进先还冲销
pub(crate) fn release_in(
    conn: &Connection,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    now: NaiveDateTime,
) -> EngineResult<ReleaseOutcome> {
    require_positive(qty, "释放")?;
    ensure_known_in(conn, material_id, location_id)?;

    let mut pos = load_position_in(conn, material_id, location_id, now)?;
    let released = qty.min(pos.reserved.non_negative());
    let uncovered_before = (pos.reserved - pos.on_hand).non_negative();
    pos.reserved -= released;
    let uncovered_after = (pos.reserved - pos.on_hand).non_negative();
    pos.updated_at = now;
    LedgerRepository::update_position_in(conn, &mut pos)?;

    let mut to_settle = uncovered_before - uncovered_after;
    let mut debt_settled = Qty::ZERO;
    let mut debts: Vec<MaterialDebt> = LedgerRepository::open_debts_for_material_in(conn, material_id)?
        .into_iter()
        .filter(|d| d.location_id == location_id)
        .collect();
    debts.reverse();
    for mut debt in debts {
        if !to_settle.is_positive() {
            break;
        }
        let applied = debt.settle(to_settle, now);
        to_settle -= applied;
        debt_settled += applied;
        LedgerRepository::update_debt_in(conn, &mut debt)?;
    }

    Ok(ReleaseOutcome {
        released,
        debt_settled,
    })
}

/// 核销欠账：未偿余额作为库存调整记入欠账库位
pub(crate) fn write_off_in(conn: &Connection, debt_id: &str, now: NaiveDateTime) -> EngineResult<MaterialDebt> {
    let mut debt = LedgerRepository::find_debt_in(conn, debt_id)?
        .ok_or_else(|| RepositoryError::not_found("MaterialDebt", debt_id))?;
    if !debt.status.is_open() {
        return Err(EngineError::invalid_state("MaterialDebt", debt_id, debt.status, "核销"));
    }

    let outstanding = debt.outstanding();
    let mut pos = load_position_in(conn, &debt.material_id, &debt.location_id, now)?;

    // 先把负账面库存抬回 0，再扣减失去覆盖的预留
    let lift = outstanding.min((-pos.on_hand).non_negative());
    pos.on_hand += lift;
    let drop = (outstanding - lift).min(pos.reserved.non_negative());
    pos.reserved -= drop;
    pos.updated_at = now;
    LedgerRepository::update_position_in(conn, &mut pos)?;

    debt.status = DebtStatus::WrittenOff;
    debt.updated_at = now;
    LedgerRepository::update_debt_in(conn, &mut debt)?;
    Ok(debt)
}

// ==========================================
// 工单维度预留
// ==========================================

/// 为工单预留物料（新增一条 Reservation）
pub(crate) fn reserve_for_task_in(
    conn: &Connection,
    task_id: &str,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<(Reservation, ReserveOutcome)> {
    let outcome = reserve_in(conn, material_id, location_id, qty, Some(task_id), now, outbox)?;
    let reservation = Reservation {
        reservation_id: uuid::Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        material_id: material_id.to_string(),
        location_id: location_id.to_string(),
        reserved_qty: qty,
        consumed_qty: Qty::ZERO,
        released_qty: Qty::ZERO,
        status: ReservationStatus::Active,
        created_at: now,
        updated_at: now,
        revision: 0,
    };
    LedgerRepository::insert_reservation_in(conn, &reservation)?;
    Ok((reservation, outcome))
}

/// 工单消耗物料：优先冲减本工单的预留
pub(crate) fn consume_for_task_in(
    conn: &Connection,
    task_id: &str,
    material_id: &str,
    location_id: &str,
    qty: Qty,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<ConsumeOutcome> {
    let reservations: Vec<Reservation> = LedgerRepository::active_reservations_for_task_in(conn, task_id)?
        .into_iter()
        .filter(|r| r.material_id == material_id && r.location_id == location_id)
        .collect();
    let reserved_total: Qty = reservations.iter().map(|r| r.remaining()).sum();

    let outcome = consume_in(
        conn,
        material_id,
        location_id,
        qty,
        Some(reserved_total),
        Some(task_id),
        now,
        outbox,
    )?;

    let mut to_book = outcome.from_reserved;
    for mut r in reservations {
        if !to_book.is_positive() {
            break;
        }
        let take = to_book.min(r.remaining());
        r.consumed_qty += take;
        to_book -= take;
        if r.remaining().is_zero() {
            r.status = ReservationStatus::Consumed;
        }
        r.updated_at = now;
        LedgerRepository::update_reservation_in(conn, &mut r)?;
    }

    Ok(outcome)
}

/// 释放工单全部未消耗预留，返回释放总量
pub(crate) fn release_task_reservations_in(
    conn: &Connection,
    task_id: &str,
    now: NaiveDateTime,
) -> EngineResult<Qty> {
    let mut total = Qty::ZERO;
    for mut r in LedgerRepository::active_reservations_for_task_in(conn, task_id)? {
        let rem = r.remaining();
        if rem.is_positive() {
            release_in(conn, &r.material_id, &r.location_id, rem, now)?;
            r.released_qty += rem;
            total += rem;
        }
        r.status = ReservationStatus::Released;
        r.updated_at = now;
        LedgerRepository::update_reservation_in(conn, &mut r)?;
    }
    if total.is_positive() {
        tracing::debug!(task_id, released = %total, "释放工单剩余预留");
    }
    Ok(total)
}

// ==========================================
// ReservationLedger - 台账引擎（对外入口）
// ==========================================
pub struct ReservationLedger {
    uow: UnitOfWork,
    locks: Arc<KeyedLock>,
    alerts: OptionalAlertPublisher,
}

impl ReservationLedger {
    pub fn new(
        conn: Arc<Mutex<rusqlite::Connection>>,
        locks: Arc<KeyedLock>,
        alerts: OptionalAlertPublisher,
    ) -> Self {
        Self {
            uow: UnitOfWork::new(conn),
            locks,
            alerts,
        }
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    /// 预留物料
    ///
    /// # 返回
    /// - Ok(ReserveOutcome): ok 恒为 true；超出库存时 debt_created = true
    /// - Err(UnknownStockPosition): 物料或库位不存在
    pub fn reserve(&self, material_id: &str, location_id: &str, qty: Qty) -> EngineResult<ReserveOutcome> {
        let _guard = self.locks.lock(&material_key(material_id));
        let mut outbox = AlertOutbox::new();
        let outcome = self.uow.run(|tx| {
            reserve_in(tx, material_id, location_id, qty, None, Self::now(), &mut outbox)
        })?;
        self.alerts.publish_all(outbox.alerts());
        Ok(outcome)
    }

    /// 消耗物料
    pub fn consume(&self, material_id: &str, location_id: &str, qty: Qty) -> EngineResult<ConsumeOutcome> {
        let _guard = self.locks.lock(&material_key(material_id));
        let mut outbox = AlertOutbox::new();
        let outcome = self.uow.run(|tx| {
            consume_in(tx, material_id, location_id, qty, None, None, Self::now(), &mut outbox)
        })?;
        self.alerts.publish_all(outbox.alerts());
        Ok(outcome)
    }

    /// 物料入库
    pub fn receive(&self, material_id: &str, location_id: &str, qty: Qty) -> EngineResult<ReceiveOutcome> {
        let _guard = self.locks.lock(&material_key(material_id));
        let outcome = self
            .uow
            .run(|tx| receive_in(tx, material_id, location_id, qty, Self::now()))?;
        tracing::info!(
            material_id,
            location_id,
            received = %qty,
            credited = %outcome.credited_to_stock,
            settled_debts = outcome.settlements.len(),
            "物料入库"
        );
        Ok(outcome)
    }

    /// 释放预留
    pub fn release(&self, material_id: &str, location_id: &str, qty: Qty) -> EngineResult<ReleaseOutcome> {
        let _guard = self.locks.lock(&material_key(material_id));
        self.uow
            .run(|tx| release_in(tx, material_id, location_id, qty, Self::now()))
    }

    /// 核销欠账
    pub fn write_off_debt(&self, debt_id: &str) -> EngineResult<MaterialDebt> {
        let material_id = self
            .uow
            .read(|conn| LedgerRepository::find_debt_in(conn, debt_id))?
            .map(|d| d.material_id)
            .ok_or_else(|| RepositoryError::not_found("MaterialDebt", debt_id))?;

        let _guard = self.locks.lock(&material_key(&material_id));
        let debt = self.uow.run(|tx| write_off_in(tx, debt_id, Self::now()))?;
        tracing::warn!(debt_id, material_id = %debt.material_id, "物料欠账已核销");
        Ok(debt)
    }

    // ===== 查询 =====

    pub fn get_stock_position(&self, material_id: &str, location_id: &str) -> EngineResult<StockPosition> {
        self.uow.read(|conn| -> EngineResult<StockPosition> {
            Ok(LedgerRepository::find_position_in(conn, material_id, location_id)?
                .unwrap_or_else(|| StockPosition::empty(material_id, location_id, Self::now())))
        })
    }

    pub fn outstanding_debt(&self, material_id: &str) -> EngineResult<Qty> {
        Ok(self
            .uow
            .read(|conn| LedgerRepository::outstanding_debt_in(conn, material_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recipe::{Location, Material};
    use crate::repository::MasterdataRepository;

    fn setup() -> (ReservationLedger, Arc<Mutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let now = chrono::Utc::now().naive_utc();
        let md = MasterdataRepository::new(conn.clone());
        md.upsert_material(
            &Material {
                material_id: "PLUSH".to_string(),
                name: "短毛绒".to_string(),
                unit_step: Qty::from_milli(1),
            },
            now,
        )
        .unwrap();
        for loc in ["WH-A", "WH-B"] {
            md.upsert_location(
                &Location {
                    location_id: loc.to_string(),
                    name: loc.to_string(),
                },
                now,
            )
            .unwrap();
        }

        let ledger = ReservationLedger::new(
            conn.clone(),
            Arc::new(KeyedLock::new()),
            OptionalAlertPublisher::none(),
        );
        (ledger, conn)
    }

    fn u(n: i64) -> Qty {
        Qty::from_units(n)
    }

    #[test]
    fn test_reserve_over_on_hand_creates_debt() {
        let (ledger, _) = setup();
        ledger.receive("PLUSH", "WH-A", u(60)).unwrap();

        let out = ledger.reserve("PLUSH", "WH-A", u(100)).unwrap();
        assert!(out.ok);
        assert!(out.debt_created);
        assert_eq!(out.debt_qty, u(40));
        assert_eq!(ledger.outstanding_debt("PLUSH").unwrap(), u(40));
    }

    #[test]
    fn test_receive_settles_debt_before_free_stock() {
        let (ledger, _) = setup();
        ledger.receive("PLUSH", "WH-A", u(60)).unwrap();
        ledger.reserve("PLUSH", "WH-A", u(100)).unwrap();

        let out = ledger.receive("PLUSH", "WH-A", u(50)).unwrap();
        assert_eq!(out.settlements.len(), 1);
        assert_eq!(out.settlements[0].status, DebtStatus::Settled);
        assert_eq!(out.credited_to_stock, u(10));

        let pos = ledger.get_stock_position("PLUSH", "WH-A").unwrap();
        assert_eq!(pos.available(), u(10));
    }

    #[test]
    fn test_consume_excess_uses_free_stock_first() {
        let (ledger, _) = setup();
        ledger.receive("PLUSH", "WH-A", u(30)).unwrap();
        ledger.reserve("PLUSH", "WH-A", u(10)).unwrap();

        // 10 冲减预留，15 取自由库存（20 可用），无欠账
        let out = ledger.consume("PLUSH", "WH-A", u(25)).unwrap();
        assert_eq!(out.from_reserved, u(10));
        assert_eq!(out.from_free_stock, u(15));
        assert!(!out.debt_created);

        // 剩余 5，消耗 8 → 欠 3
        let out = ledger.consume("PLUSH", "WH-A", u(8)).unwrap();
        assert_eq!(out.debt_qty, u(3));
        let pos = ledger.get_stock_position("PLUSH", "WH-A").unwrap();
        assert_eq!(pos.on_hand, u(-3));
        assert_eq!(pos.consumed, u(33));
    }

    #[test]
    fn test_receive_at_other_location_settles_oldest_debt() {
        let (ledger, _) = setup();
        ledger.reserve("PLUSH", "WH-B", u(20)).unwrap();

        let out = ledger.receive("PLUSH", "WH-A", u(25)).unwrap();
        assert_eq!(out.credited_to_stock, u(5));

        let a = ledger.get_stock_position("PLUSH", "WH-A").unwrap();
        let b = ledger.get_stock_position("PLUSH", "WH-B").unwrap();
        assert_eq!(a.on_hand, u(5));
        assert_eq!(b.on_hand, u(20));
        assert_eq!(b.reserved, u(20));

        // 偿还后再次预留不能凭空得到库存
        let again = ledger.reserve("PLUSH", "WH-A", u(10)).unwrap();
        assert_eq!(again.debt_qty, u(5));
    }

    #[test]
    fn test_release_settles_newest_debt() {
        let (ledger, _) = setup();
        ledger.receive("PLUSH", "WH-A", u(10)).unwrap();
        ledger.reserve("PLUSH", "WH-A", u(15)).unwrap(); // 欠 5
        ledger.reserve("PLUSH", "WH-A", u(5)).unwrap(); // 欠 5

        let out = ledger.release("PLUSH", "WH-A", u(7)).unwrap();
        assert_eq!(out.released, u(7));
        assert_eq!(out.debt_settled, u(7));
        assert_eq!(ledger.outstanding_debt("PLUSH").unwrap(), u(3));
    }

    #[test]
    fn test_write_off_debt() {
        let (ledger, conn) = setup();
        ledger.consume("PLUSH", "WH-A", u(4)).unwrap();
        let debt_id: String = conn
            .lock()
            .unwrap()
            .query_row("SELECT debt_id FROM material_debt", [], |r| r.get(0))
            .unwrap();

        let debt = ledger.write_off_debt(&debt_id).unwrap();
        assert_eq!(debt.status, DebtStatus::WrittenOff);
        assert_eq!(ledger.outstanding_debt("PLUSH").unwrap(), Qty::ZERO);
        assert_eq!(ledger.get_stock_position("PLUSH", "WH-A").unwrap().on_hand, Qty::ZERO);

        assert!(matches!(
            ledger.write_off_debt(&debt_id),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_unknown_position_is_hard_error() {
        let (ledger, _) = setup();
        assert!(matches!(
            ledger.reserve("NOPE", "WH-A", u(1)),
            Err(EngineError::UnknownStockPosition { .. })
        ));
        assert!(matches!(
            ledger.receive("PLUSH", "NOWHERE", u(1)),
            Err(EngineError::UnknownStockPosition { .. })
        ));
    }

    #[test]
    fn test_non_positive_qty_rejected() {
        let (ledger, _) = setup();
        assert!(matches!(
            ledger.reserve("PLUSH", "WH-A", Qty::ZERO),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_oversized_qty_rejected_before_touching_position() {
        let (ledger, _) = setup();
        let too_big = Qty::MAX + Qty::from_milli(1);
        for result in [
            ledger.receive("PLUSH", "WH-A", too_big).map(|_| ()),
            ledger.reserve("PLUSH", "WH-A", too_big).map(|_| ()),
            ledger.consume("PLUSH", "WH-A", Qty::from_milli(i64::MAX)).map(|_| ()),
        ] {
            assert!(matches!(result, Err(EngineError::InvalidInput(_))));
        }
        assert_eq!(ledger.get_stock_position("PLUSH", "WH-A").unwrap().on_hand, Qty::ZERO);

        ledger.receive("PLUSH", "WH-A", Qty::MAX).unwrap();
        ledger.receive("PLUSH", "WH-A", Qty::MAX).unwrap();
        let pos = ledger.get_stock_position("PLUSH", "WH-A").unwrap();
        assert_eq!(pos.on_hand, Qty::from_milli(2 * Qty::MAX.milli()));
    }
}
