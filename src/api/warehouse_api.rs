// ==========================================
// 毛绒玩具生产编排核心 - 仓储台账 API
// ==========================================
// 职责: 预留/领用/入库/释放、欠账核销、库存与告警查询
// 红线: 台账写操作全部经由 ReservationLedger（键锁 + 事务）
// ==========================================

use std::sync::Arc;

use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::{record_action, require_text};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::alert::Alert;
use crate::domain::ledger::{MaterialDebt, StockPosition};
use crate::domain::quantity::Qty;
use crate::engine::ledger::{
    ConsumeOutcome, ReceiveOutcome, ReleaseOutcome, ReservationLedger, ReserveOutcome,
};
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::alert_repo::{AlertFilter, AlertRepository};
use crate::repository::ledger_repo::LedgerRepository;

// ==========================================
// WarehouseApi - 仓储台账 API
// ==========================================

/// 仓储台账API
///
/// 职责：
/// 1. 台账原子操作（Reserve/Consume/Receive/Release）
/// 2. 欠账查询与核销
/// 3. 告警查询与确认
pub struct WarehouseApi {
    ledger: Arc<ReservationLedger>,
    ledger_repo: Arc<LedgerRepository>,
    alert_repo: Arc<AlertRepository>,
    action_log_repo: Arc<ActionLogRepository>,
}

impl WarehouseApi {
    pub fn new(
        ledger: Arc<ReservationLedger>,
        ledger_repo: Arc<LedgerRepository>,
        alert_repo: Arc<AlertRepository>,
        action_log_repo: Arc<ActionLogRepository>,
    ) -> Self {
        Self {
            ledger,
            ledger_repo,
            alert_repo,
            action_log_repo,
        }
    }

    fn now() -> chrono::NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    fn log_ledger_op(
        &self,
        action_type: ActionType,
        operator: &str,
        material_id: &str,
        location_id: &str,
        qty: Qty,
        outcome: serde_json::Value,
    ) {
        record_action(
            &self.action_log_repo,
            ActionLog::new(action_type, operator, Self::now())
                .with_ref("STOCK_POSITION", &format!("{}@{}", material_id, location_id))
                .with_payload(serde_json::json!({
                    "material_id": material_id,
                    "location_id": location_id,
                    "qty": qty,
                    "outcome": outcome,
                })),
        );
    }

    /// 预留物料（可用不足时产生欠账，不报错）
    ///
    /// # 返回
    /// - Ok(ReserveOutcome): debt_created 表示产生了欠账
    /// - Err(UnknownStockPosition): 物料或库位未登记
    pub fn reserve(
        &self,
        material_id: &str,
        location_id: &str,
        qty: Qty,
        operator: &str,
    ) -> ApiResult<ReserveOutcome> {
        let outcome = self.ledger.reserve(material_id, location_id, qty)?;
        self.log_ledger_op(
            ActionType::Reserve,
            operator,
            material_id,
            location_id,
            qty,
            serde_json::json!(outcome),
        );
        Ok(outcome)
    }

    /// 领用物料（先扣预留，再扣自由库存）
    pub fn consume(
        &self,
        material_id: &str,
        location_id: &str,
        qty: Qty,
        operator: &str,
    ) -> ApiResult<ConsumeOutcome> {
        let outcome = self.ledger.consume(material_id, location_id, qty)?;
        self.log_ledger_op(
            ActionType::Consume,
            operator,
            material_id,
            location_id,
            qty,
            serde_json::json!(outcome),
        );
        Ok(outcome)
    }

    /// 入库（先偿还欠账，余量计入可用库存）
    pub fn receive(
        &self,
        material_id: &str,
        location_id: &str,
        qty: Qty,
        operator: &str,
    ) -> ApiResult<ReceiveOutcome> {
        let outcome = self.ledger.receive(material_id, location_id, qty)?;
        self.log_ledger_op(
            ActionType::Receive,
            operator,
            material_id,
            location_id,
            qty,
            serde_json::json!(outcome),
        );
        Ok(outcome)
    }

    /// 释放预留
    pub fn release(
        &self,
        material_id: &str,
        location_id: &str,
        qty: Qty,
        operator: &str,
    ) -> ApiResult<ReleaseOutcome> {
        let outcome = self.ledger.release(material_id, location_id, qty)?;
        self.log_ledger_op(
            ActionType::Release,
            operator,
            material_id,
            location_id,
            qty,
            serde_json::json!(outcome),
        );
        Ok(outcome)
    }

    /// 核销欠账（人工确认不再补料）
    ///
    /// # 参数
    /// - reason: 核销原因（必填）
    pub fn write_off_debt(&self, debt_id: &str, operator: &str, reason: &str) -> ApiResult<MaterialDebt> {
        require_text(reason, "核销原因")?;
        let debt = self.ledger.write_off_debt(debt_id)?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::WriteOffDebt, operator, Self::now())
                .with_ref("DEBT", debt_id)
                .with_payload(serde_json::json!({
                    "material_id": debt.material_id,
                    "total_qty": debt.total_qty,
                    "settled_qty": debt.settled_qty,
                    "reason": reason,
                })),
        );
        Ok(debt)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get_stock_position(&self, material_id: &str, location_id: &str) -> ApiResult<StockPosition> {
        Ok(self.ledger.get_stock_position(material_id, location_id)?)
    }

    pub fn list_positions(&self, material_id: Option<&str>) -> ApiResult<Vec<StockPosition>> {
        Ok(self.ledger_repo.list_positions(material_id)?)
    }

    pub fn list_debts(&self, material_id: Option<&str>, open_only: bool) -> ApiResult<Vec<MaterialDebt>> {
        Ok(self.ledger_repo.list_debts(material_id, open_only)?)
    }

    pub fn outstanding_debt(&self, material_id: &str) -> ApiResult<Qty> {
        Ok(self.ledger.outstanding_debt(material_id)?)
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> ApiResult<Vec<Alert>> {
        Ok(self.alert_repo.list(filter)?)
    }

    /// 确认告警
    pub fn acknowledge_alert(&self, alert_id: &str, operator: &str) -> ApiResult<()> {
        require_text(alert_id, "告警ID")?;
        self.alert_repo.acknowledge(alert_id).map_err(ApiError::from)?;
        info!(alert_id, operator, "告警已确认");

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::AcknowledgeAlert, operator, Self::now())
                .with_ref("ALERT", alert_id),
        );
        Ok(())
    }
}
