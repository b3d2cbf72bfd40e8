// ==========================================
// 毛绒玩具生产编排核心 - 短缺/超产处理引擎
// ==========================================
// 职责: 根据工单实际产出与目标的差额决定后续流转
// - 短缺: 损耗报告 + 待审批申请，工单退回 READY
// - 超产: 不阻断，差额一次性加到紧邻下道工单的目标
// - 持平: 工单完工，进入交接
// 红线: 审批只有 APPROVED / REJECTED 两种结果；驳回后工单 BLOCKED
// ==========================================

use crate::domain::alert::{Alert, SUPERVISOR_ROLE, WAREHOUSE_ROLE};
use crate::domain::production::Task;
use crate::domain::quantity::{material_need, Qty};
use crate::domain::recipe::RecipeStage;
use crate::domain::resolution::{ApprovalRequest, WasteReport};
use crate::domain::types::{
    AlertSeverity, AlertType, ApprovalDecision, ApprovalStatus, RunState, TaskState,
};
use crate::engine::alerts::{AlertOutbox, OptionalAlertPublisher};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::keyed_lock::{task_key, KeyedLock};
use crate::engine::ledger::{
    consume_for_task_in, ensure_known_in, release_task_reservations_in, require_within_limit, ReserveOutcome,
};
use crate::engine::task_generator::{load_task_stage_in, reserve_stage_in, stage_material_keys};
use crate::repository::{ProductionRepository, ResolutionRepository, UnitOfWork};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::instrument;
use uuid::Uuid;

// ==========================================
// 处理结果
// ==========================================

/// 报工处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputResolution {
    /// 产出不足，等待审批
    Shortage {
        shortfall: Qty,
        approval_id: String,
        waste_report_id: String,
    },
    /// 超产，已并入下道工单目标
    Surplus {
        surplus: Qty,
        next_task_id: Option<String>,
    },
    /// 与目标持平
    Balanced,
}

impl OutputResolution {
    pub fn is_shortage(&self) -> bool {
        matches!(self, OutputResolution::Shortage { .. })
    }
}

/// 报工结果（含工单最新状态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputOutcome {
    pub task: Task,
    pub resolution: OutputResolution,
    pub run_done: bool,
    pub debts_created: Vec<String>,
}

/// 审批结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub approval: ApprovalRequest,
    pub task: Task,
    pub additional_reservations: Vec<ReserveOutcome>,
}

// ==========================================
// 事务内辅助
// ==========================================

/// 按报工件数（合格 + 不良）消耗工序物料，返回新欠账ID
fn consume_stage_in(
    conn: &Connection,
    task_id: &str,
    stage: &RecipeStage,
    pieces: Qty,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<Vec<String>> {
    let mut debts = Vec::new();
    for req in &stage.requirements {
        let material = ensure_known_in(conn, &req.material_id, &req.location_id)?;
        let need = material_need(pieces, req.qty_per_unit, req.wastage_pct, material.unit_step);
        if !need.is_positive() {
            continue;
        }
        let outcome =
            consume_for_task_in(conn, task_id, &req.material_id, &req.location_id, need, now, outbox)?;
        debts.extend(outcome.debt_id);
    }
    Ok(debts)
}

// ==========================================
// ShortageResolver - 短缺/超产处理引擎
// ==========================================
pub struct ShortageResolver {
    uow: UnitOfWork,
    locks: Arc<KeyedLock>,
    alerts: OptionalAlertPublisher,
}

impl ShortageResolver {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
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

    /// 报工
    ///
    /// # 参数
    /// - task_id: RUNNING 状态的工单
    /// - actual_qty: 本次合格产出件数
    /// - reject_qty: 本次不良件数
    ///
    /// # 返回
    /// - Ok(OutputOutcome): 短缺/超产/持平均以返回值表达
    /// - Err: 工单状态不对 / 数量非法 / 主数据缺失
    #[instrument(skip(self))]
    pub fn record_task_output(
        &self,
        task_id: &str,
        actual_qty: Qty,
        reject_qty: Qty,
    ) -> EngineResult<OutputOutcome> {
        if actual_qty.is_negative() || reject_qty.is_negative() {
            return Err(EngineError::InvalidInput(format!(
                "报工数量不能为负: actual={}, reject={}",
                actual_qty, reject_qty
            )));
        }
        require_within_limit(actual_qty, "合格")?;
        require_within_limit(reject_qty, "不良")?;
        if actual_qty.is_zero() && reject_qty.is_zero() {
            return Err(EngineError::InvalidInput("报工数量不能全部为0".to_string()));
        }
        if !actual_qty.is_whole_units() || !reject_qty.is_whole_units() {
            return Err(EngineError::InvalidInput(format!(
                "报工数量必须为整件: actual={}, reject={}",
                actual_qty, reject_qty
            )));
        }

        let (stage, successor_id) = self.uow.read(|conn| -> EngineResult<(RecipeStage, Option<String>)> {
            let (_, _, stage) = load_task_stage_in(conn, task_id)?;
            let successor = ProductionRepository::find_successor_in(conn, task_id)?;
            Ok((stage, successor.map(|t| t.task_id)))
        })?;

        let mut keys = stage_material_keys(&stage);
        keys.push(task_key(task_id));
        if let Some(next_id) = &successor_id {
            keys.push(task_key(next_id));
        }
        let _guards = self.locks.lock_many(keys);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let mut task = ProductionRepository::get_task_in(tx, task_id)?;
            let mut run = ProductionRepository::get_run_in(tx, &task.run_id)?;
            if run.state.is_closed() {
                return Err(EngineError::RunClosed {
                    run_id: run.run_id,
                    state: run.state.to_string(),
                });
            }
            if task.state != TaskState::Running {
                return Err(EngineError::invalid_state("Task", task_id, task.state, "报工"));
            }

            task.actual_output_qty += actual_qty;
            task.reject_qty += reject_qty;
            let debts_created =
                consume_stage_in(tx, task_id, &stage, actual_qty + reject_qty, now, &mut outbox)?;

            let delta = task.output_delta();
            let mut run_done = false;
            let resolution = if delta.is_negative() {
                let shortfall = -delta;
                let report = WasteReport {
                    report_id: Uuid::new_v4().to_string(),
                    task_id: task_id.to_string(),
                    shortfall_qty: shortfall,
                    reject_qty: task.reject_qty,
                    reason: format!(
                        "累计合格 {} 低于目标 {}（累计不良 {}）",
                        task.actual_output_qty, task.target_qty, task.reject_qty
                    ),
                    created_at: now,
                };
                ResolutionRepository::insert_waste_report_in(tx, &report)?;

                let approval = ApprovalRequest {
                    approval_id: Uuid::new_v4().to_string(),
                    task_id: task_id.to_string(),
                    waste_report_id: report.report_id.clone(),
                    shortfall_qty: shortfall,
                    status: ApprovalStatus::Pending,
                    requested_at: now,
                    decided_at: None,
                    decided_by: None,
                    comment: None,
                    revision: 0,
                };
                ResolutionRepository::insert_approval_in(tx, &approval)?;

                task.state = TaskState::Ready;
                outbox.raise_in(
                    tx,
                    Alert::new(
                        AlertType::ShortageApprovalRequired,
                        AlertSeverity::Warning,
                        "TASK",
                        task_id,
                        format!(
                            "{} 工单产出短缺 {}，等待审批",
                            task.department, shortfall
                        ),
                        now,
                    )
                    .with_department(task.department)
                    .with_recipient(SUPERVISOR_ROLE)
                    .with_payload(json!({
                        "approval_id": approval.approval_id,
                        "waste_report_id": report.report_id,
                        "shortfall": shortfall,
                        "target": task.target_qty,
                        "actual": task.actual_output_qty,
                    })),
                )?;

                OutputResolution::Shortage {
                    shortfall,
                    approval_id: approval.approval_id,
                    waste_report_id: report.report_id,
                }
            } else {
                task.state = TaskState::Finished;
                release_task_reservations_in(tx, task_id, now)?;

                let next = ProductionRepository::find_successor_in(tx, task_id)?;
                let resolution = if delta.is_positive() {
                    let mut next_task_id = None;
                    if let Some(mut next) = next.clone() {
                        next.target_qty += delta;
                        next.updated_at = now;
                        ProductionRepository::update_task_in(tx, &mut next)?;
                        outbox.raise_in(
                            tx,
                            Alert::new(
                                AlertType::SurplusAbsorbed,
                                AlertSeverity::Info,
                                "TASK",
                                &next.task_id,
                                format!(
                                    "{} 超产 {}，{} 工单目标调整为 {}",
                                    task.department, delta, next.department, next.target_qty
                                ),
                                now,
                            )
                            .with_department(next.department)
                            .with_recipient(SUPERVISOR_ROLE)
                            .with_payload(json!({
                                "from_task_id": task_id,
                                "surplus": delta,
                                "new_target": next.target_qty,
                            })),
                        )?;
                        next_task_id = Some(next.task_id);
                    }
                    tracing::info!(task_id, surplus = %delta, "超产并入下道工序目标");
                    OutputResolution::Surplus {
                        surplus: delta,
                        next_task_id,
                    }
                } else {
                    OutputResolution::Balanced
                };

                if next.is_none() {
                    run.state = RunState::Done;
                    run.updated_at = now;
                    ProductionRepository::update_run_in(tx, &mut run)?;
                    run_done = true;
                }
                resolution
            };

            task.updated_at = now;
            ProductionRepository::update_task_in(tx, &mut task)?;

            Ok(OutputOutcome {
                task,
                resolution,
                run_done,
                debts_created,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            task_id,
            state = %outcome.task.state,
            actual = %outcome.task.actual_output_qty,
            target = %outcome.task.target_qty,
            shortage = outcome.resolution.is_shortage(),
            run_done = outcome.run_done,
            "报工处理完成"
        );
        Ok(outcome)
    }

    /// 审批短缺申请
    ///
    /// - APPROVED: 按短缺件数追加预留，工单可重新开工；
    ///   入口预留失败而阻断的工单在此重试预留，成功后回到 READY，仍失败则审批保持 PENDING
    /// - REJECTED: 工单 BLOCKED，等待人工介入
    #[instrument(skip(self, comment))]
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        actor: &str,
        comment: Option<&str>,
    ) -> EngineResult<ApprovalOutcome> {
        let (task_id, stage) = self.uow.read(|conn| -> EngineResult<(String, RecipeStage)> {
            let approval = ResolutionRepository::get_approval_in(conn, approval_id)?;
            let (_, _, stage) = load_task_stage_in(conn, &approval.task_id)?;
            Ok((approval.task_id, stage))
        })?;

        let mut keys = stage_material_keys(&stage);
        keys.push(task_key(&task_id));
        let _guards = self.locks.lock_many(keys);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let mut approval = ResolutionRepository::get_approval_in(tx, approval_id)?;
            if approval.status != ApprovalStatus::Pending {
                return Err(EngineError::invalid_state(
                    "ApprovalRequest",
                    approval_id,
                    approval.status,
                    "审批",
                ));
            }
            let mut task = ProductionRepository::get_task_in(tx, &task_id)?;
            let run = ProductionRepository::get_run_in(tx, &task.run_id)?;
            if run.state.is_closed() {
                return Err(EngineError::RunClosed {
                    run_id: run.run_id,
                    state: run.state.to_string(),
                });
            }

            approval.status = decision.as_status();
            approval.decided_at = Some(now);
            approval.decided_by = Some(actor.to_string());
            approval.comment = comment.map(str::to_string);
            ResolutionRepository::update_approval_in(tx, &mut approval)?;

            let mut additional_reservations = Vec::new();
            match decision {
                ApprovalDecision::Approved => {
                    additional_reservations =
                        reserve_stage_in(tx, &task_id, &stage, approval.shortfall_qty, now, &mut outbox)?;
                    if task.state == TaskState::Blocked {
                        task.state = TaskState::Ready;
                        task.block_reason = None;
                        task.updated_at = now;
                        ProductionRepository::update_task_in(tx, &mut task)?;
                    }
                }
                ApprovalDecision::Rejected => {
                    task.state = TaskState::Blocked;
                    task.block_reason = Some(format!("短缺审批驳回: {}", approval_id));
                    task.updated_at = now;
                    ProductionRepository::update_task_in(tx, &mut task)?;
                    outbox.raise_in(
                        tx,
                        Alert::new(
                            AlertType::ShortageRejected,
                            AlertSeverity::Critical,
                            "TASK",
                            &task_id,
                            format!(
                                "{} 工单短缺 {} 审批驳回，工单阻断",
                                task.department, approval.shortfall_qty
                            ),
                            now,
                        )
                        .with_department(task.department)
                        .with_recipient(SUPERVISOR_ROLE)
                        .with_recipient(WAREHOUSE_ROLE)
                        .with_payload(json!({
                            "approval_id": approval_id,
                            "decided_by": actor,
                            "comment": approval.comment,
                        })),
                    )?;
                }
            }

            Ok(ApprovalOutcome {
                approval,
                task,
                additional_reservations,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            approval_id,
            actor,
            status = %outcome.approval.status,
            task_state = %outcome.task.state,
            "短缺审批已处理"
        );
        Ok(outcome)
    }
}
