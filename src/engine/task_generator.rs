// ==========================================
// 毛绒玩具生产编排核心 - 工单生成引擎
// ==========================================
// 职责: 按配方图把一次生产请求分解为部门工单链
// 输入: 成品 + 请求件数 + 部门缓冲系数
// 输出: ProductionRun + Task 链（入口工单 READY，其余 PENDING）
// 红线:
// - 目标件数 = 请求件数 × 累计缓冲系数，截断为整件
// - 生成时只有入口工序预留物料；后续工序在开工时预留
// - 预留失败（主数据缺失）仍落库全部工单，入口工单 BLOCKED，并按短缺流程登记待审批申请
// ==========================================

use crate::config::{OrchestrationPolicy, PolicyReader};
use crate::domain::alert::{Alert, SUPERVISOR_ROLE, WAREHOUSE_ROLE};
use crate::domain::production::{ProductionRun, Task};
use crate::domain::quantity::{buffered_target, material_need, BufferFactor, Qty};
use crate::domain::recipe::{RecipeGraph, RecipeGraphError, RecipeStage};
use crate::domain::resolution::{ApprovalRequest, WasteReport};
use crate::domain::types::{AlertSeverity, AlertType, ApprovalStatus, RunState, TaskState};
use crate::engine::alerts::{AlertOutbox, OptionalAlertPublisher};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::keyed_lock::{material_key, task_key, KeyedLock};
use crate::engine::ledger::{
    ensure_known_in, release_task_reservations_in, require_within_limit, reserve_for_task_in, ReserveOutcome,
};
use crate::repository::{
    LedgerRepository, ProductionRepository, RecipeRepository, RepositoryError, ResolutionRepository,
    UnitOfWork,
};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::instrument;
use uuid::Uuid;

// ==========================================
// 参数与结果
// ==========================================

/// 分解选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// 是否包含可选工序（如绣花）
    pub include_optional_stages: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_optional_stages: true,
        }
    }
}

/// 分解结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub run: ProductionRun,
    pub tasks: Vec<Task>,             // 按工序顺序
    pub reservation_error: Option<String>, // 入口预留失败原因（入口工单 BLOCKED）
    pub shortage_approval_id: Option<String>, // 入口预留失败时登记的待审批申请
    pub debts_created: Vec<String>,   // 入口预留产生的欠账ID
}

/// 取消结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub run: ProductionRun,
    pub released_qty: Qty,
    pub approvals_cancelled: usize,
}

/// 解除阻断结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockOutcome {
    pub task: Task,
    pub still_blocked: bool,
}

// ==========================================
// 工序物料（事务内，调用方已持有 material 键锁）
// ==========================================

/// 工序涉及的全部物料键
pub(crate) fn stage_material_keys(stage: &RecipeStage) -> Vec<String> {
    stage
        .requirements
        .iter()
        .map(|r| material_key(&r.material_id))
        .collect()
}

/// 读取工单、所属批次与对应配方工序
pub(crate) fn load_task_stage_in(
    conn: &Connection,
    task_id: &str,
) -> EngineResult<(Task, ProductionRun, RecipeStage)> {
    let task = ProductionRepository::get_task_in(conn, task_id)?;
    let run = ProductionRepository::get_run_in(conn, &task.run_id)?;
    let graph = RecipeRepository::find_graph_in(conn, &run.recipe_version_id)?
        .ok_or_else(|| RepositoryError::not_found("RecipeVersion", &run.recipe_version_id))?;
    let stage = graph
        .stages
        .into_iter()
        .find(|s| s.stage_id == task.stage_id)
        .ok_or_else(|| RepositoryError::not_found("RecipeStage", &task.stage_id))?;
    Ok((task, run, stage))
}

/// 为工单按件数预留工序全部物料
///
/// 先校验全部物料/库位存在，任何一项未知则不写入任何预留
pub(crate) fn reserve_stage_in(
    conn: &Connection,
    task_id: &str,
    stage: &RecipeStage,
    pieces: Qty,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<Vec<ReserveOutcome>> {
    let materials = stage
        .requirements
        .iter()
        .map(|r| ensure_known_in(conn, &r.material_id, &r.location_id))
        .collect::<EngineResult<Vec<_>>>()?;

    let mut outcomes = Vec::with_capacity(materials.len());
    for (req, material) in stage.requirements.iter().zip(&materials) {
        let need = material_need(pieces, req.qty_per_unit, req.wastage_pct, material.unit_step);
        if !need.is_positive() {
            continue;
        }
        let (_, outcome) =
            reserve_for_task_in(conn, task_id, &req.material_id, &req.location_id, need, now, outbox)?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn reservation_failed_alert(task: &Task, reason: &str, now: NaiveDateTime) -> Alert {
    Alert::new(
        AlertType::ReservationFailed,
        AlertSeverity::Critical,
        "TASK",
        &task.task_id,
        format!("{} 工单物料预留失败: {}", task.department, reason),
        now,
    )
    .with_department(task.department)
    .with_recipient(WAREHOUSE_ROLE)
    .with_recipient(SUPERVISOR_ROLE)
    .with_payload(json!({ "run_id": task.run_id, "reason": reason }))
}

/// 入口预留失败: 工单 BLOCKED，整单目标记为短缺并提交审批
///
/// 批准时重试入口预留（见 ShortageResolver::resolve_approval）
fn block_for_reservation_in(
    conn: &Connection,
    task: &mut Task,
    reason: &str,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<ApprovalRequest> {
    task.state = TaskState::Blocked;
    task.block_reason = Some(reason.to_string());
    task.updated_at = now;
    ProductionRepository::update_task_in(conn, task)?;

    let report = WasteReport {
        report_id: Uuid::new_v4().to_string(),
        task_id: task.task_id.clone(),
        shortfall_qty: task.target_qty,
        reject_qty: Qty::ZERO,
        reason: format!("入口物料预留失败: {}", reason),
        created_at: now,
    };
    ResolutionRepository::insert_waste_report_in(conn, &report)?;

    let approval = ApprovalRequest {
        approval_id: Uuid::new_v4().to_string(),
        task_id: task.task_id.clone(),
        waste_report_id: report.report_id.clone(),
        shortfall_qty: task.target_qty,
        status: ApprovalStatus::Pending,
        requested_at: now,
        decided_at: None,
        decided_by: None,
        comment: None,
        revision: 0,
    };
    ResolutionRepository::insert_approval_in(conn, &approval)?;

    outbox.raise_in(conn, reservation_failed_alert(task, reason, now))?;
    outbox.raise_in(
        conn,
        Alert::new(
            AlertType::ShortageApprovalRequired,
            AlertSeverity::Warning,
            "TASK",
            &task.task_id,
            format!("{} 工单物料无法预留，短缺 {} 件等待审批", task.department, task.target_qty),
            now,
        )
        .with_department(task.department)
        .with_recipient(SUPERVISOR_ROLE)
        .with_payload(json!({
            "approval_id": approval.approval_id,
            "waste_report_id": report.report_id,
            "shortfall": task.target_qty,
            "reason": reason,
        })),
    )?;
    Ok(approval)
}

/// 计算工序链各工序的缓冲后目标
///
/// 工序自带缓冲系数优先，否则使用部门默认值
pub fn plan_targets(requested: Qty, chain: &[&RecipeStage], policy: &OrchestrationPolicy) -> Vec<Qty> {
    let mut factors: Vec<BufferFactor> = Vec::with_capacity(chain.len());
    chain
        .iter()
        .map(|stage| {
            factors.push(
                stage
                    .buffer_factor
                    .unwrap_or_else(|| policy.buffer_factor(stage.department)),
            );
            buffered_target(requested, &factors)
        })
        .collect()
}

// ==========================================
// TaskGenerator - 工单生成引擎
// ==========================================
pub struct TaskGenerator {
    uow: UnitOfWork,
    recipes: RecipeRepository,
    locks: Arc<KeyedLock>,
    alerts: OptionalAlertPublisher,
    policy: Arc<dyn PolicyReader>,
}

impl TaskGenerator {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        locks: Arc<KeyedLock>,
        alerts: OptionalAlertPublisher,
        policy: Arc<dyn PolicyReader>,
    ) -> Self {
        Self {
            uow: UnitOfWork::new(conn.clone()),
            recipes: RecipeRepository::new(conn),
            locks,
            alerts,
            policy,
        }
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    fn load_policy(&self) -> EngineResult<OrchestrationPolicy> {
        self.policy
            .load_policy()
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// 分解生产请求
    ///
    /// # 参数
    /// - article_id: 成品ID（必须存在 ACTIVE 配方）
    /// - requested_qty: 请求件数（整件，> 0）
    /// - created_by: 操作人
    /// - options: 分解选项
    ///
    /// # 返回
    /// - Ok(GenerationOutcome): 预留失败时 reservation_error 有值，批次与工单照常落库
    /// - Err: 输入非法 / 配方缺失 / 仓储错误
    #[instrument(skip(self, options))]
    pub fn generate_run(
        &self,
        article_id: &str,
        requested_qty: Qty,
        created_by: &str,
        options: RunOptions,
    ) -> EngineResult<GenerationOutcome> {
        if !requested_qty.is_positive() || !requested_qty.is_whole_units() {
            return Err(EngineError::InvalidInput(format!(
                "请求件数必须为正整数: {}",
                requested_qty
            )));
        }
        require_within_limit(requested_qty, "请求")?;

        let policy = self.load_policy()?;
        let graph = self
            .recipes
            .find_active_graph(article_id)?
            .ok_or_else(|| EngineError::RecipeNotFound {
                article_id: article_id.to_string(),
            })?;
        RecipeGraph::validate(&graph.stages)?;

        let chain: Vec<&RecipeStage> = graph
            .stages
            .iter()
            .filter(|s| options.include_optional_stages || !s.optional)
            .collect();
        let entry = *chain.first().ok_or(RecipeGraphError::Empty)?;
        let targets = plan_targets(requested_qty, &chain, &policy);

        let _guards = self.locks.lock_many(stage_material_keys(entry));
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let run = ProductionRun {
                run_id: Uuid::new_v4().to_string(),
                article_id: article_id.to_string(),
                recipe_version_id: graph.version.recipe_version_id.clone(),
                batch_id: format!(
                    "B{}-{}",
                    now.format("%Y%m%d"),
                    &Uuid::new_v4().simple().to_string()[..8]
                ),
                requested_qty,
                state: RunState::Draft,
                created_by: created_by.to_string(),
                created_at: now,
                updated_at: now,
                revision: 0,
            };
            ProductionRepository::insert_run_in(tx, &run)?;

            let mut tasks: Vec<Task> = Vec::with_capacity(chain.len());
            for (stage, target) in chain.iter().zip(&targets) {
                let predecessor_task_id = tasks.last().map(|t| t.task_id.clone());
                let task = Task {
                    task_id: Uuid::new_v4().to_string(),
                    run_id: run.run_id.clone(),
                    stage_id: stage.stage_id.clone(),
                    department: stage.department,
                    seq_no: tasks.len() as i32 + 1,
                    state: if predecessor_task_id.is_none() {
                        TaskState::Ready
                    } else {
                        TaskState::Pending
                    },
                    predecessor_task_id,
                    target_qty: *target,
                    input_qty: Qty::ZERO,
                    actual_output_qty: Qty::ZERO,
                    reject_qty: Qty::ZERO,
                    block_reason: None,
                    created_at: now,
                    updated_at: now,
                    revision: 0,
                };
                ProductionRepository::insert_task_in(tx, &task)?;
                tasks.push(task);
            }

            let mut reservation_error = None;
            let mut shortage_approval_id = None;
            let mut debts_created = Vec::new();
            let entry_task = &mut tasks[0];
            match reserve_stage_in(tx, &entry_task.task_id, entry, entry_task.target_qty, now, &mut outbox) {
                Ok(outcomes) => {
                    debts_created = outcomes.into_iter().filter_map(|o| o.debt_id).collect();
                }
                Err(e @ EngineError::UnknownStockPosition { .. }) => {
                    let reason = e.to_string();
                    let approval = block_for_reservation_in(tx, entry_task, &reason, now, &mut outbox)?;
                    shortage_approval_id = Some(approval.approval_id);
                    reservation_error = Some(reason);
                }
                Err(e) => return Err(e),
            }

            Ok(GenerationOutcome {
                run,
                tasks,
                reservation_error,
                shortage_approval_id,
                debts_created,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            run_id = %outcome.run.run_id,
            batch_id = %outcome.run.batch_id,
            tasks = outcome.tasks.len(),
            debts = outcome.debts_created.len(),
            blocked = outcome.reservation_error.is_some(),
            "生产请求分解完成"
        );
        Ok(outcome)
    }

    /// 工单开工 READY → RUNNING
    ///
    /// 非入口工单在首次开工时预留本工序物料
    #[instrument(skip(self))]
    pub fn start_task(&self, task_id: &str) -> EngineResult<Task> {
        let (_, _, stage) = self.uow.read(|conn| load_task_stage_in(conn, task_id))?;

        let mut keys = stage_material_keys(&stage);
        keys.push(task_key(task_id));
        let _guards = self.locks.lock_many(keys);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let task = self.uow.run(|tx| {
            let mut task = ProductionRepository::get_task_in(tx, task_id)?;
            let mut run = ProductionRepository::get_run_in(tx, &task.run_id)?;
            if run.state.is_closed() {
                return Err(EngineError::RunClosed {
                    run_id: run.run_id,
                    state: run.state.to_string(),
                });
            }
            if task.state != TaskState::Ready {
                return Err(EngineError::invalid_state("Task", task_id, task.state, "开工"));
            }
            if let Some(predecessor_id) = &task.predecessor_task_id {
                let predecessor = ProductionRepository::get_task_in(tx, predecessor_id)?;
                if predecessor.state != TaskState::Finished {
                    return Err(EngineError::PredecessorNotFinished {
                        task_id: task_id.to_string(),
                        predecessor_id: predecessor_id.clone(),
                    });
                }
                if !task.input_qty.is_positive() {
                    return Err(EngineError::InputNotDelivered {
                        task_id: task_id.to_string(),
                    });
                }
            }
            if ResolutionRepository::pending_approval_for_task_in(tx, task_id)?.is_some() {
                return Err(EngineError::ApprovalPending {
                    task_id: task_id.to_string(),
                });
            }

            if LedgerRepository::count_reservations_for_task_in(tx, task_id)? == 0 {
                reserve_stage_in(tx, task_id, &stage, task.target_qty, now, &mut outbox)?;
            }

            task.state = TaskState::Running;
            task.block_reason = None;
            task.updated_at = now;
            ProductionRepository::update_task_in(tx, &mut task)?;

            if run.state == RunState::Draft {
                run.state = RunState::InProgress;
                run.updated_at = now;
                ProductionRepository::update_run_in(tx, &mut run)?;
            }
            Ok(task)
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(task_id, department = %task.department, "工单开工");
        Ok(task)
    }

    /// 取消生产批次
    ///
    /// 释放全部未消耗预留并作废待审批申请；已消耗物料与已完成交接不回滚
    #[instrument(skip(self))]
    pub fn cancel_run(&self, run_id: &str, actor: &str) -> EngineResult<CancelOutcome> {
        let (graph, tasks) = self.uow.read(|conn| -> EngineResult<(RecipeGraph, Vec<Task>)> {
            let run = ProductionRepository::get_run_in(conn, run_id)?;
            let graph = RecipeRepository::find_graph_in(conn, &run.recipe_version_id)?
                .ok_or_else(|| RepositoryError::not_found("RecipeVersion", &run.recipe_version_id))?;
            let tasks = ProductionRepository::tasks_for_run_in(conn, run_id)?;
            Ok((graph, tasks))
        })?;

        let keys: Vec<String> = graph
            .stages
            .iter()
            .flat_map(stage_material_keys)
            .chain(tasks.iter().map(|t| task_key(&t.task_id)))
            .collect();
        let _guards = self.locks.lock_many(keys);
        let now = Self::now();

        let outcome = self.uow.run(|tx| {
            let mut run = ProductionRepository::get_run_in(tx, run_id)?;
            if run.state.is_closed() {
                return Err(EngineError::invalid_state("ProductionRun", run_id, run.state, "取消"));
            }

            let mut released_qty = Qty::ZERO;
            let mut approvals_cancelled = 0;
            for task in ProductionRepository::tasks_for_run_in(tx, run_id)? {
                released_qty += release_task_reservations_in(tx, &task.task_id, now)?;
                if let Some(mut approval) =
                    ResolutionRepository::pending_approval_for_task_in(tx, &task.task_id)?
                {
                    approval.status = ApprovalStatus::Cancelled;
                    approval.decided_at = Some(now);
                    approval.decided_by = Some(actor.to_string());
                    approval.comment = Some("批次取消".to_string());
                    ResolutionRepository::update_approval_in(tx, &mut approval)?;
                    approvals_cancelled += 1;
                }
            }

            run.state = RunState::Cancelled;
            run.updated_at = now;
            ProductionRepository::update_run_in(tx, &mut run)?;
            Ok(CancelOutcome {
                run,
                released_qty,
                approvals_cancelled,
            })
        })?;

        tracing::warn!(
            run_id,
            actor,
            released = %outcome.released_qty,
            approvals_cancelled = outcome.approvals_cancelled,
            "生产批次已取消"
        );
        Ok(outcome)
    }

    /// 人工解除阻断 BLOCKED → READY
    ///
    /// 短缺审批未决时不可解除（由审批结果决定）；
    /// 因预留失败阻断的入口工单先重新预留，仍失败则保持 BLOCKED 并再次告警
    #[instrument(skip(self))]
    pub fn unblock_task(&self, task_id: &str) -> EngineResult<UnblockOutcome> {
        let (_, _, stage) = self.uow.read(|conn| load_task_stage_in(conn, task_id))?;

        let mut keys = stage_material_keys(&stage);
        keys.push(task_key(task_id));
        let _guards = self.locks.lock_many(keys);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let mut task = ProductionRepository::get_task_in(tx, task_id)?;
            let run = ProductionRepository::get_run_in(tx, &task.run_id)?;
            if run.state.is_closed() {
                return Err(EngineError::RunClosed {
                    run_id: run.run_id,
                    state: run.state.to_string(),
                });
            }
            if task.state != TaskState::Blocked {
                return Err(EngineError::invalid_state("Task", task_id, task.state, "解除阻断"));
            }
            if ResolutionRepository::pending_approval_for_task_in(tx, task_id)?.is_some() {
                return Err(EngineError::ApprovalPending {
                    task_id: task_id.to_string(),
                });
            }

            let needs_entry_reservation = task.is_entry()
                && !stage.requirements.is_empty()
                && LedgerRepository::count_reservations_for_task_in(tx, task_id)? == 0;
            if needs_entry_reservation {
                match reserve_stage_in(tx, task_id, &stage, task.target_qty, now, &mut outbox) {
                    Ok(_) => {}
                    Err(e @ EngineError::UnknownStockPosition { .. }) => {
                        let reason = e.to_string();
                        task.block_reason = Some(reason.clone());
                        task.updated_at = now;
                        ProductionRepository::update_task_in(tx, &mut task)?;
                        outbox.raise_in(tx, reservation_failed_alert(&task, &reason, now))?;
                        return Ok(UnblockOutcome {
                            task,
                            still_blocked: true,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            task.state = TaskState::Ready;
            task.block_reason = None;
            task.updated_at = now;
            ProductionRepository::update_task_in(tx, &mut task)?;
            Ok(UnblockOutcome {
                task,
                still_blocked: false,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(task_id, still_blocked = outcome.still_blocked, "工单解除阻断");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticPolicyReader;
    use crate::domain::types::{AlertType, Department, ReservationStatus};
    use crate::engine::alerts::CollectingAlertPublisher;
    use crate::engine::fixtures::{memory_conn, q, seed_bear, ARTICLE, LOCATION};
    use crate::engine::ledger::ReservationLedger;
    use crate::repository::MasterdataRepository;

    fn setup() -> (TaskGenerator, Arc<Mutex<Connection>>, Arc<CollectingAlertPublisher>) {
        let conn = memory_conn();
        seed_bear(&conn);
        let collector = Arc::new(CollectingAlertPublisher::new());
        let generator = TaskGenerator::new(
            conn.clone(),
            Arc::new(KeyedLock::new()),
            OptionalAlertPublisher::with_publisher(collector.clone()),
            Arc::new(StaticPolicyReader::default()),
        );
        (generator, conn, collector)
    }

    #[test]
    fn test_buffered_targets_truncate_to_whole_pieces() {
        let (generator, _, _) = setup();
        let out = generator
            .generate_run(ARTICLE, q("500"), "planner", RunOptions::default())
            .unwrap();

        let targets: Vec<Qty> = out.tasks.iter().map(|t| t.target_qty).collect();
        assert_eq!(targets, vec![q("550"), q("577"), q("577")]);
        assert_eq!(out.tasks[0].state, TaskState::Ready);
        assert_eq!(out.tasks[1].state, TaskState::Pending);
        assert_eq!(out.tasks[2].state, TaskState::Pending);
        assert_eq!(out.tasks[1].predecessor_task_id.as_deref(), Some(out.tasks[0].task_id.as_str()));
        assert_eq!(out.run.state, RunState::Draft);
    }

    #[test]
    fn test_entry_reservation_rounds_up_and_records_debt() {
        let (generator, conn, collector) = setup();
        let out = generator
            .generate_run(ARTICLE, q("500"), "planner", RunOptions::default())
            .unwrap();

        // 550 × 0.5 × 1.05 = 288.75，无库存 → 全额欠账，入口仍 READY
        assert_eq!(out.debts_created.len(), 1);
        assert_eq!(out.tasks[0].state, TaskState::Ready);

        let reservations = LedgerRepository::new(conn.clone())
            .reservations_for_task(&out.tasks[0].task_id)
            .unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].reserved_qty, q("288.75"));
        assert_eq!(reservations[0].status, ReservationStatus::Active);

        // 后续工序生成时不预留
        let later = LedgerRepository::new(conn)
            .reservations_for_task(&out.tasks[2].task_id)
            .unwrap();
        assert!(later.is_empty());

        let alerts = collector.drain();
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::DebtCreated));
    }

    #[test]
    fn test_optional_stage_skipped() {
        let (generator, _, _) = setup();
        let out = generator
            .generate_run(
                ARTICLE,
                q("100"),
                "planner",
                RunOptions {
                    include_optional_stages: false,
                },
            )
            .unwrap();
        let depts: Vec<Department> = out.tasks.iter().map(|t| t.department).collect();
        assert_eq!(depts, vec![Department::Cutting, Department::Sewing]);
        assert_eq!(out.tasks[1].predecessor_task_id.as_deref(), Some(out.tasks[0].task_id.as_str()));
        assert_eq!(out.tasks[1].seq_no, 2);
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let (generator, _, _) = setup();
        assert!(matches!(
            generator.generate_run(ARTICLE, Qty::ZERO, "planner", RunOptions::default()),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            generator.generate_run(ARTICLE, q("10.5"), "planner", RunOptions::default()),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            generator.generate_run("NO-SUCH", q("10"), "planner", RunOptions::default()),
            Err(EngineError::RecipeNotFound { .. })
        ));
    }

    fn publish_with_unknown_material(conn: &Arc<Mutex<Connection>>) {
        // 新版本引用尚未登记的物料
        let mut stages = crate::engine::fixtures::bear_stages();
        stages[0].requirements[0].material_id = "MINKY".to_string();
        RecipeRepository::new(conn.clone())
            .publish_version(ARTICLE, &stages, chrono::Utc::now().naive_utc())
            .unwrap();
    }

    fn register_minky(conn: &Arc<Mutex<Connection>>) {
        MasterdataRepository::new(conn.clone())
            .upsert_material(
                &crate::domain::recipe::Material {
                    material_id: "MINKY".to_string(),
                    name: "水晶超柔".to_string(),
                    unit_step: q("0.001"),
                },
                chrono::Utc::now().naive_utc(),
            )
            .unwrap();
    }

    #[test]
    fn test_unknown_material_raises_shortage_then_approval_reserves() {
        let (generator, conn, collector) = setup();
        publish_with_unknown_material(&conn);
        let resolver = crate::engine::resolver::ShortageResolver::new(
            conn.clone(),
            Arc::new(KeyedLock::new()),
            OptionalAlertPublisher::none(),
        );

        let out = generator
            .generate_run(ARTICLE, q("10"), "planner", RunOptions::default())
            .unwrap();
        assert!(out.reservation_error.is_some());
        assert_eq!(out.tasks.len(), 3);
        assert_eq!(out.tasks[0].state, TaskState::Blocked);
        let approval_id = out.shortage_approval_id.clone().unwrap();

        let alerts = collector.drain();
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::ReservationFailed));
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::ShortageApprovalRequired));

        let entry_id = out.tasks[0].task_id.clone();
        let resolutions = ResolutionRepository::new(conn.clone());
        let reports = resolutions.waste_reports_for_task(&entry_id).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].shortfall_qty, q("11"));
        let approval = resolutions.find_approval(&approval_id).unwrap().unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.shortfall_qty, q("11"));

        // 审批未决不可人工解除
        assert!(matches!(
            generator.unblock_task(&entry_id),
            Err(EngineError::ApprovalPending { .. })
        ));

        // 主数据未修正前批准失败，审批保持 PENDING
        assert!(matches!(
            resolver.resolve_approval(&approval_id, crate::domain::types::ApprovalDecision::Approved, "supervisor", None),
            Err(EngineError::UnknownStockPosition { .. })
        ));
        assert_eq!(
            resolutions.find_approval(&approval_id).unwrap().unwrap().status,
            ApprovalStatus::Pending
        );

        register_minky(&conn);
        let approved = resolver
            .resolve_approval(&approval_id, crate::domain::types::ApprovalDecision::Approved, "supervisor", None)
            .unwrap();
        assert_eq!(approved.task.state, TaskState::Ready);
        assert!(approved.task.block_reason.is_none());
        // 11 × 0.5 × 1.05 = 5.775
        assert_eq!(approved.additional_reservations.len(), 1);
        let reservations = LedgerRepository::new(conn)
            .reservations_for_task(&entry_id)
            .unwrap();
        assert_eq!(reservations[0].reserved_qty, q("5.775"));

        assert_eq!(generator.start_task(&entry_id).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_rejected_reservation_shortage_unblocks_after_fix() {
        let (generator, conn, collector) = setup();
        publish_with_unknown_material(&conn);
        let resolver = crate::engine::resolver::ShortageResolver::new(
            conn.clone(),
            Arc::new(KeyedLock::new()),
            OptionalAlertPublisher::none(),
        );

        let out = generator
            .generate_run(ARTICLE, q("10"), "planner", RunOptions::default())
            .unwrap();
        let entry_id = out.tasks[0].task_id.clone();
        let rejected = resolver
            .resolve_approval(
                out.shortage_approval_id.as_deref().unwrap(),
                crate::domain::types::ApprovalDecision::Rejected,
                "supervisor",
                Some("先补登物料"),
            )
            .unwrap();
        assert_eq!(rejected.task.state, TaskState::Blocked);
        collector.drain();

        // 主数据未修正前解除阻断仍失败并再次告警
        let still = generator.unblock_task(&entry_id).unwrap();
        assert!(still.still_blocked);
        assert!(collector
            .drain()
            .iter()
            .any(|a| a.alert_type == AlertType::ReservationFailed));

        register_minky(&conn);
        let fixed = generator.unblock_task(&entry_id).unwrap();
        assert!(!fixed.still_blocked);
        assert_eq!(fixed.task.state, TaskState::Ready);
    }

    #[test]
    fn test_start_task_checks_predecessor_and_moves_run() {
        let (generator, conn, _) = setup();
        let out = generator
            .generate_run(ARTICLE, q("10"), "planner", RunOptions::default())
            .unwrap();

        assert!(matches!(
            generator.start_task(&out.tasks[1].task_id),
            Err(EngineError::InvalidState { .. })
        ));

        let started = generator.start_task(&out.tasks[0].task_id).unwrap();
        assert_eq!(started.state, TaskState::Running);
        let run = ProductionRepository::new(conn)
            .find_run(&out.run.run_id)
            .unwrap()
            .unwrap();
        assert_eq!(run.state, RunState::InProgress);
    }

    #[test]
    fn test_cancel_run_releases_reservations() {
        let (generator, conn, _) = setup();
        let ledger = ReservationLedger::new(
            conn.clone(),
            Arc::new(KeyedLock::new()),
            OptionalAlertPublisher::none(),
        );
        ledger.receive("PLUSH", LOCATION, q("1000")).unwrap();

        let out = generator
            .generate_run(ARTICLE, q("100"), "planner", RunOptions::default())
            .unwrap();
        assert_eq!(ledger.get_stock_position("PLUSH", LOCATION).unwrap().reserved, q("57.75"));

        let cancelled = generator.cancel_run(&out.run.run_id, "supervisor").unwrap();
        assert_eq!(cancelled.run.state, RunState::Cancelled);
        assert_eq!(cancelled.released_qty, q("57.75"));
        assert_eq!(ledger.get_stock_position("PLUSH", LOCATION).unwrap().reserved, Qty::ZERO);

        assert!(matches!(
            generator.start_task(&out.tasks[0].task_id),
            Err(EngineError::RunClosed { .. })
        ));
        assert!(matches!(
            generator.cancel_run(&out.run.run_id, "supervisor"),
            Err(EngineError::InvalidState { .. })
        ));
    }
}
