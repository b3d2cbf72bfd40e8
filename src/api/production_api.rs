// ==========================================
// 毛绒玩具生产编排核心 - 生产 API
// ==========================================
// 职责: 批次分解、工单开工/报工、短缺审批、阻断解除、批次取消
// 红线: 人工干预（解除阻断/取消批次）必须填写原因
// ==========================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::{record_action, require_text};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::production::{ProductionRun, Task};
use crate::domain::quantity::Qty;
use crate::domain::resolution::{ApprovalRequest, WasteReport};
use crate::domain::types::{ApprovalDecision, ApprovalStatus, Department, RunState, TaskState};
use crate::engine::resolver::{ApprovalOutcome, OutputOutcome, ShortageResolver};
use crate::engine::task_generator::{
    CancelOutcome, GenerationOutcome, RunOptions, TaskGenerator, UnblockOutcome,
};
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::production_repo::ProductionRepository;
use crate::repository::resolution_repo::ResolutionRepository;

/// 批次详情（批次 + 按工序排列的工单）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: ProductionRun,
    pub tasks: Vec<Task>,
}

// ==========================================
// ProductionApi - 生产 API
// ==========================================

/// 生产API
///
/// 职责：
/// 1. 生产请求分解（TaskGenerator）
/// 2. 开工、报工与短缺审批（ShortageResolver）
/// 3. 车间看板查询
pub struct ProductionApi {
    generator: Arc<TaskGenerator>,
    resolver: Arc<ShortageResolver>,
    production_repo: Arc<ProductionRepository>,
    resolution_repo: Arc<ResolutionRepository>,
    action_log_repo: Arc<ActionLogRepository>,
}

impl ProductionApi {
    pub fn new(
        generator: Arc<TaskGenerator>,
        resolver: Arc<ShortageResolver>,
        production_repo: Arc<ProductionRepository>,
        resolution_repo: Arc<ResolutionRepository>,
        action_log_repo: Arc<ActionLogRepository>,
    ) -> Self {
        Self {
            generator,
            resolver,
            production_repo,
            resolution_repo,
            action_log_repo,
        }
    }

    fn now() -> chrono::NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    /// 分解生产请求
    ///
    /// # 参数
    /// - article_id: 成品ID
    /// - requested_qty: 请求件数（正整数）
    /// - operator: 操作人
    /// - options: 分解选项（是否包含可选工序）
    ///
    /// # 返回
    /// - Ok(GenerationOutcome): reservation_error 有值时入口工单为 BLOCKED，
    ///   shortage_approval_id 为对应的待审批申请
    pub fn generate_run(
        &self,
        article_id: &str,
        requested_qty: Qty,
        operator: &str,
        options: RunOptions,
    ) -> ApiResult<GenerationOutcome> {
        require_text(article_id, "成品ID")?;
        require_text(operator, "操作人")?;

        let outcome = self
            .generator
            .generate_run(article_id, requested_qty, operator, options)?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::GenerateRun, operator, Self::now())
                .with_ref("RUN", &outcome.run.run_id)
                .with_payload(serde_json::json!({
                    "article_id": article_id,
                    "requested_qty": requested_qty,
                    "batch_id": outcome.run.batch_id,
                    "targets": outcome
                        .tasks
                        .iter()
                        .map(|t| serde_json::json!({ "department": t.department, "target_qty": t.target_qty }))
                        .collect::<Vec<_>>(),
                    "reservation_error": outcome.reservation_error,
                    "shortage_approval_id": outcome.shortage_approval_id,
                    "debts_created": outcome.debts_created,
                })),
        );
        Ok(outcome)
    }

    /// 工单开工
    pub fn start_task(&self, task_id: &str, operator: &str) -> ApiResult<Task> {
        let task = self.generator.start_task(task_id)?;
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::StartTask, operator, Self::now())
                .with_ref("TASK", task_id)
                .with_payload(serde_json::json!({
                    "department": task.department,
                    "target_qty": task.target_qty,
                })),
        );
        Ok(task)
    }

    /// 报工
    ///
    /// # 参数
    /// - actual_qty: 合格件数
    /// - reject_qty: 不良件数
    pub fn record_task_output(
        &self,
        task_id: &str,
        actual_qty: Qty,
        reject_qty: Qty,
        operator: &str,
    ) -> ApiResult<OutputOutcome> {
        let outcome = self
            .resolver
            .record_task_output(task_id, actual_qty, reject_qty)?;
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::RecordOutput, operator, Self::now())
                .with_ref("TASK", task_id)
                .with_payload(serde_json::json!({
                    "actual_qty": actual_qty,
                    "reject_qty": reject_qty,
                    "resolution": outcome.resolution,
                    "run_done": outcome.run_done,
                })),
        );
        Ok(outcome)
    }

    /// 审批短缺申请
    ///
    /// # 参数
    /// - comment: 驳回时必填
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        operator: &str,
        comment: Option<&str>,
    ) -> ApiResult<ApprovalOutcome> {
        require_text(operator, "审批人")?;
        if decision == ApprovalDecision::Rejected
            && comment.map(|c| c.trim().is_empty()).unwrap_or(true)
        {
            return Err(ApiError::InvalidInput("驳回时必须填写审批意见".to_string()));
        }

        let outcome = self
            .resolver
            .resolve_approval(approval_id, decision, operator, comment)?;
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::ResolveApproval, operator, Self::now())
                .with_ref("APPROVAL", approval_id)
                .with_payload(serde_json::json!({
                    "task_id": outcome.task.task_id,
                    "decision": outcome.approval.status,
                    "shortfall_qty": outcome.approval.shortfall_qty,
                    "comment": comment,
                })),
        );
        Ok(outcome)
    }

    /// 解除工单阻断（人工确认已处理主数据或物料问题）
    pub fn unblock_task(&self, task_id: &str, operator: &str, reason: &str) -> ApiResult<UnblockOutcome> {
        require_text(reason, "解除原因")?;
        let outcome = self.generator.unblock_task(task_id)?;
        info!(task_id, operator, still_blocked = outcome.still_blocked, "工单阻断解除处理完成");

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::UnblockTask, operator, Self::now())
                .with_ref("TASK", task_id)
                .with_payload(serde_json::json!({
                    "reason": reason,
                    "still_blocked": outcome.still_blocked,
                    "state": outcome.task.state,
                })),
        );
        Ok(outcome)
    }

    /// 取消批次（释放全部预留，撤销待审批申请）
    pub fn cancel_run(&self, run_id: &str, operator: &str, reason: &str) -> ApiResult<CancelOutcome> {
        require_text(reason, "取消原因")?;
        let outcome = self.generator.cancel_run(run_id, operator)?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::CancelRun, operator, Self::now())
                .with_ref("RUN", run_id)
                .with_payload(serde_json::json!({
                    "reason": reason,
                    "released_qty": outcome.released_qty,
                    "approvals_cancelled": outcome.approvals_cancelled,
                }))
                .with_detail(format!("取消批次 {}", outcome.run.batch_id)),
        );
        Ok(outcome)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get_run(&self, run_id: &str) -> ApiResult<RunDetail> {
        let run = self
            .production_repo
            .find_run(run_id)?
            .ok_or_else(|| ApiError::NotFound(format!("生产批次(id={})不存在", run_id)))?;
        let tasks = self.production_repo.tasks_for_run(run_id)?;
        Ok(RunDetail { run, tasks })
    }

    pub fn list_runs(&self, state: Option<RunState>) -> ApiResult<Vec<ProductionRun>> {
        Ok(self.production_repo.list_runs(state)?)
    }

    pub fn get_task(&self, task_id: &str) -> ApiResult<Task> {
        self.production_repo
            .find_task(task_id)?
            .ok_or_else(|| ApiError::NotFound(format!("工单(id={})不存在", task_id)))
    }

    /// 部门看板
    pub fn list_department_tasks(
        &self,
        department: Department,
        state: Option<TaskState>,
    ) -> ApiResult<Vec<Task>> {
        Ok(self.production_repo.tasks_for_department(department, state)?)
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> ApiResult<Vec<ApprovalRequest>> {
        Ok(self.resolution_repo.list_approvals(status)?)
    }

    pub fn waste_reports(&self, task_id: &str) -> ApiResult<Vec<WasteReport>> {
        Ok(self.resolution_repo.waste_reports_for_task(task_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticPolicyReader;
    use crate::engine::alerts::OptionalAlertPublisher;
    use crate::engine::fixtures::{memory_conn, q, seed_bear, ARTICLE, LOCATION};
    use crate::engine::keyed_lock::KeyedLock;
    use crate::engine::ledger::ReservationLedger;

    struct Ctx {
        api: ProductionApi,
        ledger: ReservationLedger,
        logs: Arc<ActionLogRepository>,
    }

    fn setup() -> Ctx {
        let conn = memory_conn();
        seed_bear(&conn);
        let locks = Arc::new(KeyedLock::new());
        let logs = Arc::new(ActionLogRepository::new(conn.clone()));
        let api = ProductionApi::new(
            Arc::new(TaskGenerator::new(
                conn.clone(),
                locks.clone(),
                OptionalAlertPublisher::none(),
                Arc::new(StaticPolicyReader::default()),
            )),
            Arc::new(ShortageResolver::new(
                conn.clone(),
                locks.clone(),
                OptionalAlertPublisher::none(),
            )),
            Arc::new(ProductionRepository::new(conn.clone())),
            Arc::new(ResolutionRepository::new(conn.clone())),
            logs.clone(),
        );
        Ctx {
            api,
            ledger: ReservationLedger::new(conn, locks, OptionalAlertPublisher::none()),
            logs,
        }
    }

    #[test]
    fn test_generate_start_and_report() {
        let ctx = setup();
        ctx.ledger.receive("PLUSH", LOCATION, q("1000")).unwrap();

        let out = ctx
            .api
            .generate_run(ARTICLE, q("100"), "planner", RunOptions::default())
            .unwrap();
        assert!(out.reservation_error.is_none());

        let detail = ctx.api.get_run(&out.run.run_id).unwrap();
        assert_eq!(detail.tasks.len(), 3);
        assert_eq!(detail.tasks[0].state, TaskState::Ready);

        let entry = &detail.tasks[0];
        ctx.api.start_task(&entry.task_id, "cutter-1").unwrap();
        let res = ctx
            .api
            .record_task_output(&entry.task_id, q("110"), Qty::ZERO, "cutter-1")
            .unwrap();
        assert_eq!(res.task.state, TaskState::Finished);

        let board = ctx
            .api
            .list_department_tasks(Department::Cutting, Some(TaskState::Finished))
            .unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(ctx.logs.count_by_action_type("GenerateRun").unwrap(), 1);
        assert_eq!(ctx.logs.count_by_action_type("StartTask").unwrap(), 1);
        assert_eq!(ctx.logs.count_by_action_type("RecordOutput").unwrap(), 1);
    }

    #[test]
    fn test_shortage_approval_flow() {
        let ctx = setup();
        ctx.ledger.receive("PLUSH", LOCATION, q("1000")).unwrap();
        let out = ctx
            .api
            .generate_run(ARTICLE, q("100"), "planner", RunOptions::default())
            .unwrap();
        let entry_id = out.tasks[0].task_id.clone();
        ctx.api.start_task(&entry_id, "cutter-1").unwrap();

        let res = ctx
            .api
            .record_task_output(&entry_id, q("100"), q("4"), "cutter-1")
            .unwrap();
        assert!(res.resolution.is_shortage());
        assert_eq!(ctx.api.waste_reports(&entry_id).unwrap().len(), 1);

        let pending = ctx.api.list_approvals(Some(ApprovalStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);

        let err = ctx
            .api
            .resolve_approval(&pending[0].approval_id, ApprovalDecision::Rejected, "supervisor", None)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));

        let approved = ctx
            .api
            .resolve_approval(&pending[0].approval_id, ApprovalDecision::Approved, "supervisor", None)
            .unwrap();
        assert_eq!(approved.approval.status, ApprovalStatus::Approved);
        assert!(ctx
            .api
            .list_approvals(Some(ApprovalStatus::Pending))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_manual_interventions_require_reason() {
        let ctx = setup();
        let out = ctx
            .api
            .generate_run(ARTICLE, q("10"), "planner", RunOptions::default())
            .unwrap();

        assert!(matches!(
            ctx.api.cancel_run(&out.run.run_id, "planner", "").unwrap_err(),
            ApiError::InvalidInput(_)
        ));
        assert!(matches!(
            ctx.api.unblock_task(&out.tasks[0].task_id, "planner", " ").unwrap_err(),
            ApiError::InvalidInput(_)
        ));

        let cancelled = ctx.api.cancel_run(&out.run.run_id, "planner", "客户撤单").unwrap();
        assert_eq!(cancelled.run.state, RunState::Cancelled);
        assert!(matches!(
            ctx.api.get_run("missing").unwrap_err(),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ctx.api.generate_run(ARTICLE, q("0"), "planner", RunOptions::default()).unwrap_err(),
            ApiError::InvalidInput(_)
        ));
    }
}
