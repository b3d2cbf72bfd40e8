// ==========================================
// 毛绒玩具生产编排核心 - 交接 API
// ==========================================
// 职责: 部门间在制品交接（发起/接收/更正/完成/重试）、产线暂停与恢复
// 红线: 产线占用判断全部在 HandshakeProtocol 内完成
// ==========================================

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::{record_action, require_text};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::handshake::{LineStatus, TransferRecord};
use crate::domain::quantity::Qty;
use crate::domain::types::{Department, TransferState};
use crate::engine::handshake::{AcceptOutcome, CompleteOutcome, HandshakeProtocol, InitiateOutcome};
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::transfer_repo::TransferRepository;

// ==========================================
// HandshakeApi - 交接 API
// ==========================================
pub struct HandshakeApi {
    protocol: Arc<HandshakeProtocol>,
    transfer_repo: Arc<TransferRepository>,
    action_log_repo: Arc<ActionLogRepository>,
}

impl HandshakeApi {
    pub fn new(
        protocol: Arc<HandshakeProtocol>,
        transfer_repo: Arc<TransferRepository>,
        action_log_repo: Arc<ActionLogRepository>,
    ) -> Self {
        Self {
            protocol,
            transfer_repo,
            action_log_repo,
        }
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    fn log_transfer(&self, action_type: ActionType, operator: &str, transfer: &TransferRecord, extra: serde_json::Value) {
        record_action(
            &self.action_log_repo,
            ActionLog::new(action_type, operator, Self::now())
                .with_ref("TRANSFER", &transfer.transfer_id)
                .with_payload(serde_json::json!({
                    "from_task_id": transfer.from_task_id,
                    "to_department": transfer.to_department,
                    "batch_id": transfer.batch_id,
                    "sent_qty": transfer.sent_qty,
                    "state": transfer.state,
                    "extra": extra,
                })),
        );
    }

    /// 发起交接
    ///
    /// # 参数
    /// - from_task_id: 已完工的发送工单
    /// - dest: 目标部门
    /// - qty: 交接件数
    /// - batch_id: 批次号
    ///
    /// # 返回
    /// - Ok(InitiateOutcome): blocked = true 表示目标产线被其他批次占用或暂停
    pub fn initiate_transfer(
        &self,
        from_task_id: &str,
        dest: Department,
        qty: Qty,
        batch_id: &str,
        operator: &str,
    ) -> ApiResult<InitiateOutcome> {
        require_text(batch_id, "批次号")?;
        let outcome = self
            .protocol
            .initiate_transfer(from_task_id, dest, qty, batch_id)?;
        self.log_transfer(
            ActionType::InitiateTransfer,
            operator,
            &outcome.transfer,
            serde_json::json!({ "blocked": outcome.blocked, "line": outcome.line }),
        );
        Ok(outcome)
    }

    /// 重试 BLOCKED 交接（生成新交接单）
    pub fn retry_transfer(&self, transfer_id: &str, operator: &str) -> ApiResult<InitiateOutcome> {
        let outcome = self.protocol.retry_transfer(transfer_id)?;
        self.log_transfer(
            ActionType::RetryTransfer,
            operator,
            &outcome.transfer,
            serde_json::json!({ "retry_of": transfer_id, "blocked": outcome.blocked }),
        );
        Ok(outcome)
    }

    /// 接收确认（差异超出容差则拒收）
    pub fn accept_transfer(&self, transfer_id: &str, received_qty: Qty, operator: &str) -> ApiResult<AcceptOutcome> {
        let outcome = self.protocol.accept_transfer(transfer_id, received_qty)?;
        self.log_transfer(
            ActionType::AcceptTransfer,
            operator,
            &outcome.transfer,
            serde_json::json!({
                "received_qty": received_qty,
                "accepted": outcome.accepted,
                "tolerance_pct": outcome.tolerance_pct,
            }),
        );
        Ok(outcome)
    }

    /// 发送方更正交接数量（仅 LOCKED 状态）
    pub fn correct_transfer(
        &self,
        transfer_id: &str,
        corrected_qty: Qty,
        operator: &str,
        reason: &str,
    ) -> ApiResult<TransferRecord> {
        require_text(reason, "更正原因")?;
        let transfer = self.protocol.correct_transfer(transfer_id, corrected_qty)?;
        self.log_transfer(
            ActionType::CorrectTransfer,
            operator,
            &transfer,
            serde_json::json!({ "corrected_qty": corrected_qty, "reason": reason }),
        );
        Ok(transfer)
    }

    /// 完成交接（批次在该产线无其他交接时释放产线）
    pub fn complete_transfer(&self, transfer_id: &str, operator: &str) -> ApiResult<CompleteOutcome> {
        let outcome = self.protocol.complete_transfer(transfer_id)?;
        self.log_transfer(
            ActionType::CompleteTransfer,
            operator,
            &outcome.transfer,
            serde_json::json!({ "line_released": outcome.line_released }),
        );
        Ok(outcome)
    }

    /// 暂停产线
    pub fn pause_line(&self, department: Department, operator: &str, reason: &str) -> ApiResult<LineStatus> {
        require_text(reason, "暂停原因")?;
        let status = self.protocol.pause_line(department)?;
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::PauseLine, operator, Self::now())
                .with_ref("LINE", department.to_db_str())
                .with_payload(serde_json::json!({ "reason": reason, "batch_id": status.batch_id })),
        );
        Ok(status)
    }

    /// 恢复产线
    pub fn resume_line(&self, department: Department, operator: &str) -> ApiResult<LineStatus> {
        let status = self.protocol.resume_line(department)?;
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::ResumeLine, operator, Self::now())
                .with_ref("LINE", department.to_db_str())
                .with_payload(serde_json::json!({ "state": status.state, "batch_id": status.batch_id })),
        );
        Ok(status)
    }

    /// 超时扫描（供定时任务调用）
    pub fn scan_stale_transfers(&self) -> ApiResult<Vec<TransferRecord>> {
        let alerted = self.protocol.scan_stale_transfers(Self::now())?;
        if !alerted.is_empty() {
            info!(count = alerted.len(), "超时交接已告警");
        }
        Ok(alerted)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get_line_status(&self, department: Department) -> ApiResult<LineStatus> {
        Ok(self.protocol.get_line_status(department)?)
    }

    pub fn list_lines(&self) -> ApiResult<Vec<LineStatus>> {
        Ok(self
            .transfer_repo
            .list_lines()?
            .iter()
            .map(LineStatus::from)
            .collect())
    }

    pub fn get_transfer(&self, transfer_id: &str) -> ApiResult<TransferRecord> {
        self.transfer_repo
            .find_transfer(transfer_id)?
            .ok_or_else(|| ApiError::NotFound(format!("交接单(id={})不存在", transfer_id)))
    }

    pub fn transfers_for_task(&self, task_id: &str) -> ApiResult<Vec<TransferRecord>> {
        Ok(self.transfer_repo.transfers_for_task(task_id)?)
    }

    /// 部门收货看板
    pub fn list_transfers(
        &self,
        to_department: Option<Department>,
        state: Option<TransferState>,
    ) -> ApiResult<Vec<TransferRecord>> {
        Ok(self.transfer_repo.list_transfers(to_department, state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticPolicyReader;
    use crate::domain::types::LineState;
    use crate::engine::alerts::OptionalAlertPublisher;
    use crate::engine::fixtures::{memory_conn, q, seed_bear, ARTICLE, LOCATION};
    use crate::engine::keyed_lock::KeyedLock;
    use crate::engine::ledger::ReservationLedger;
    use crate::engine::resolver::ShortageResolver;
    use crate::engine::task_generator::{RunOptions, TaskGenerator};

    struct Ctx {
        api: HandshakeApi,
        logs: Arc<ActionLogRepository>,
        generator: TaskGenerator,
        resolver: ShortageResolver,
    }

    fn setup() -> Ctx {
        let conn = memory_conn();
        seed_bear(&conn);
        let locks = Arc::new(KeyedLock::new());
        let policy = Arc::new(StaticPolicyReader::default());
        ReservationLedger::new(conn.clone(), locks.clone(), OptionalAlertPublisher::none())
            .receive("PLUSH", LOCATION, q("1000"))
            .unwrap();
        let logs = Arc::new(ActionLogRepository::new(conn.clone()));
        Ctx {
            api: HandshakeApi::new(
                Arc::new(HandshakeProtocol::new(
                    conn.clone(),
                    locks.clone(),
                    OptionalAlertPublisher::none(),
                    policy.clone(),
                )),
                Arc::new(TransferRepository::new(conn.clone())),
                logs.clone(),
            ),
            logs,
            generator: TaskGenerator::new(
                conn.clone(),
                locks.clone(),
                OptionalAlertPublisher::none(),
                policy,
            ),
            resolver: ShortageResolver::new(conn, locks, OptionalAlertPublisher::none()),
        }
    }

    /// 切裁完工，返回 (切裁工单ID, 批次号)
    fn finished_cutting(ctx: &Ctx) -> (String, String) {
        let out = ctx
            .generator
            .generate_run(ARTICLE, q("100"), "planner", RunOptions::default())
            .unwrap();
        let entry = out.tasks[0].task_id.clone();
        ctx.generator.start_task(&entry).unwrap();
        ctx.resolver
            .record_task_output(&entry, q("110"), Qty::ZERO)
            .unwrap();
        (entry, out.run.batch_id)
    }

    #[test]
    fn test_transfer_round_trip() {
        let ctx = setup();
        let (entry, batch) = finished_cutting(&ctx);

        let init = ctx
            .api
            .initiate_transfer(&entry, Department::Embroidery, q("110"), &batch, "cutter-1")
            .unwrap();
        assert!(!init.blocked);
        assert_eq!(
            ctx.api.get_line_status(Department::Embroidery).unwrap().state,
            LineState::Occupied
        );

        let tid = init.transfer.transfer_id.clone();
        let accepted = ctx.api.accept_transfer(&tid, q("110"), "embroider-1").unwrap();
        assert!(accepted.accepted);

        let done = ctx.api.complete_transfer(&tid, "embroider-1").unwrap();
        assert!(done.line_released);
        assert_eq!(done.line.state, LineState::Clear);
        assert_eq!(ctx.api.get_transfer(&tid).unwrap().state, TransferState::Completed);
        assert_eq!(ctx.api.transfers_for_task(&entry).unwrap().len(), 1);
        assert_eq!(ctx.logs.count_by_action_type("CompleteTransfer").unwrap(), 1);
    }

    #[test]
    fn test_pause_requires_reason_and_blocks() {
        let ctx = setup();
        let (entry, batch) = finished_cutting(&ctx);

        assert!(matches!(
            ctx.api.pause_line(Department::Embroidery, "supervisor", "").unwrap_err(),
            ApiError::InvalidInput(_)
        ));
        let paused = ctx
            .api
            .pause_line(Department::Embroidery, "supervisor", "设备保养")
            .unwrap();
        assert_eq!(paused.state, LineState::Paused);

        let init = ctx
            .api
            .initiate_transfer(&entry, Department::Embroidery, q("110"), &batch, "cutter-1")
            .unwrap();
        assert!(init.blocked);
        assert_eq!(
            ctx.api
                .list_transfers(Some(Department::Embroidery), Some(TransferState::Blocked))
                .unwrap()
                .len(),
            1
        );

        ctx.api.resume_line(Department::Embroidery, "supervisor").unwrap();
        let retried = ctx
            .api
            .retry_transfer(&init.transfer.transfer_id, "cutter-1")
            .unwrap();
        assert!(!retried.blocked);
        assert_eq!(ctx.api.list_lines().unwrap().len(), Department::ALL.len());
    }
}
