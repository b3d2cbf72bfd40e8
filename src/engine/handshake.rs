// ==========================================
// 毛绒玩具生产编排核心 - 工序交接引擎
// ==========================================
// 状态机: INITIATED → LOCKED → ACCEPTED → COMPLETED
//         INITIATED → BLOCKED（目标产线被其他批次占用/暂停）
// 红线:
// - 同一目标产线的“检查占用 + 锁定”在 line:{DEPT} 键锁内原子完成
// - 一条产线同一时刻只允许一个批次 OCCUPIED
// - 数量差异超出接收部门容差时拒收，交接保持 LOCKED
// - 不自动超时释放；长时间 LOCKED 只告警
// - 批次关闭（取消/完成）后在途交接仍可接收、完成，只登记实物，不再改动接收工单
// ==========================================

use crate::config::{OrchestrationPolicy, PolicyReader};
use crate::domain::alert::{department_recipient, Alert, SUPERVISOR_ROLE};
use crate::domain::handshake::{LineOccupancy, LineStatus, TransferRecord};
use crate::domain::quantity::{exceeds_tolerance, Qty};
use crate::domain::types::{AlertSeverity, AlertType, Department, LineState, TaskState, TransferState};
use crate::engine::alerts::{AlertOutbox, OptionalAlertPublisher};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::keyed_lock::{line_key, task_key, KeyedLock};
use crate::engine::ledger::require_within_limit;
use crate::repository::{ProductionRepository, RepositoryError, TransferRepository, UnitOfWork};
use chrono::{Duration, NaiveDateTime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::instrument;
use uuid::Uuid;

// ==========================================
// 操作结果
// ==========================================

/// 发起交接结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateOutcome {
    pub transfer: TransferRecord,
    /// true: 目标产线不可进入，交接记为 BLOCKED
    pub blocked: bool,
    pub line: LineStatus,
}

/// 接收确认结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptOutcome {
    pub transfer: TransferRecord,
    /// false: 数量差异超限被拒收，交接仍为 LOCKED
    pub accepted: bool,
    pub tolerance_pct: Qty,
}

/// 完成交接结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteOutcome {
    pub transfer: TransferRecord,
    pub line: LineStatus,
    pub line_released: bool,
}

// ==========================================
// 事务内辅助
// ==========================================

/// 产线释放后若有等待中的 BLOCKED 交接则告警
fn notify_line_cleared_in(
    conn: &Connection,
    line: &LineOccupancy,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<()> {
    if line.state != LineState::Clear {
        return Ok(());
    }
    let waiting = TransferRepository::blocked_for_department_in(conn, line.department)?;
    if waiting.is_empty() {
        return Ok(());
    }
    let waiting_ids: Vec<&str> = waiting.iter().map(|t| t.transfer_id.as_str()).collect();
    let mut alert = Alert::new(
        AlertType::LineCleared,
        AlertSeverity::Info,
        "LINE",
        line.department.to_db_str(),
        format!("{} 产线已空闲，{} 条交接等待重试", line.department, waiting.len()),
        now,
    )
    .with_department(line.department)
    .with_recipient(SUPERVISOR_ROLE)
    .with_payload(json!({ "waiting_transfers": waiting_ids }));
    for t in &waiting {
        alert = alert.with_recipient(&department_recipient(t.from_department));
    }
    outbox.raise_in(conn, alert)?;
    Ok(())
}

/// 发起交接（调用方已持有 task:{from} 与 line:{dest} 键锁）
#[allow(clippy::too_many_arguments)]
fn initiate_in(
    conn: &Connection,
    from_task_id: &str,
    dest: Department,
    qty: Qty,
    batch_id: &str,
    retry_of: Option<&str>,
    now: NaiveDateTime,
    outbox: &mut AlertOutbox,
) -> EngineResult<InitiateOutcome> {
    if !qty.is_positive() {
        return Err(EngineError::InvalidInput(format!("交接数量必须大于0: {}", qty)));
    }
    require_within_limit(qty, "交接")?;

    let sender = ProductionRepository::get_task_in(conn, from_task_id)?;
    let run = ProductionRepository::get_run_in(conn, &sender.run_id)?;
    if run.state.is_closed() {
        return Err(EngineError::RunClosed {
            run_id: run.run_id,
            state: run.state.to_string(),
        });
    }
    if sender.state != TaskState::Finished {
        return Err(EngineError::invalid_state("Task", from_task_id, sender.state, "发起交接"));
    }
    if run.batch_id != batch_id {
        return Err(EngineError::InvalidInput(format!(
            "批次号不匹配: 期望 {}, 实际 {}",
            run.batch_id, batch_id
        )));
    }
    let receiver = ProductionRepository::find_successor_in(conn, from_task_id)?.ok_or_else(|| {
        EngineError::InvalidInput(format!("终端工单没有下道工序: {}", from_task_id))
    })?;
    if receiver.department != dest {
        return Err(EngineError::WrongDestination {
            expected: receiver.department,
            actual: dest,
        });
    }

    let available = sender.actual_output_qty - TransferRepository::held_output_in(conn, from_task_id)?;
    if qty > available {
        return Err(EngineError::TransferQtyExceeded {
            task_id: from_task_id.to_string(),
            requested: qty,
            available,
        });
    }

    let mut line = TransferRepository::get_line_in(conn, dest)?;
    let mut transfer = TransferRecord {
        transfer_id: Uuid::new_v4().to_string(),
        from_task_id: from_task_id.to_string(),
        to_task_id: receiver.task_id.clone(),
        from_department: sender.department,
        to_department: dest,
        batch_id: batch_id.to_string(),
        sent_qty: qty,
        received_qty: None,
        state: TransferState::Initiated,
        block_reason: None,
        last_rejected_qty: None,
        mismatch_count: 0,
        retry_of: retry_of.map(str::to_string),
        initiated_at: now,
        locked_at: None,
        accepted_at: None,
        completed_at: None,
        blocked_at: None,
        stale_alerted_at: None,
        revision: 0,
    };

    if !line.admits(batch_id) {
        let reason = match line.state {
            LineState::Paused => format!("{} 产线已暂停", dest),
            _ => format!(
                "{} 产线被批次 {} 占用",
                dest,
                line.batch_id.as_deref().unwrap_or("-")
            ),
        };
        transfer.state = TransferState::Blocked;
        transfer.blocked_at = Some(now);
        transfer.block_reason = Some(reason.clone());
        TransferRepository::insert_transfer_in(conn, &transfer)?;

        outbox.raise_in(
            conn,
            Alert::new(
                AlertType::LineClearanceRequired,
                AlertSeverity::Warning,
                "TRANSFER",
                &transfer.transfer_id,
                format!("{}，{} 的交接等待清线", reason, sender.department),
                now,
            )
            .with_department(dest)
            .with_recipient(SUPERVISOR_ROLE)
            .with_payload(json!({
                "batch_id": batch_id,
                "occupying_batch": line.batch_id,
                "line_state": line.state,
                "qty": qty,
            })),
        )?;

        return Ok(InitiateOutcome {
            transfer,
            blocked: true,
            line: LineStatus::from(&line),
        });
    }

    transfer.state = TransferState::Locked;
    transfer.locked_at = Some(now);
    TransferRepository::insert_transfer_in(conn, &transfer)?;

    if line.state != LineState::Occupied || line.batch_id.as_deref() != Some(batch_id) {
        line.state = LineState::Occupied;
        line.batch_id = Some(batch_id.to_string());
        line.updated_at = now;
        TransferRepository::update_line_in(conn, &mut line)?;
    }

    Ok(InitiateOutcome {
        transfer,
        blocked: false,
        line: LineStatus::from(&line),
    })
}

// ==========================================
// HandshakeProtocol - 工序交接引擎
// ==========================================
pub struct HandshakeProtocol {
    uow: UnitOfWork,
    locks: Arc<KeyedLock>,
    alerts: OptionalAlertPublisher,
    policy: Arc<dyn PolicyReader>,
}

impl HandshakeProtocol {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        locks: Arc<KeyedLock>,
        alerts: OptionalAlertPublisher,
        policy: Arc<dyn PolicyReader>,
    ) -> Self {
        Self {
            uow: UnitOfWork::new(conn),
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

    fn load_transfer(&self, transfer_id: &str) -> EngineResult<TransferRecord> {
        Ok(self
            .uow
            .read(|conn| TransferRepository::get_transfer_in(conn, transfer_id))?)
    }

    /// 发起交接（检查产线占用并锁定）
    ///
    /// # 参数
    /// - from_task_id: 已完工的发送工单
    /// - dest: 目标部门（必须是下道工单所在部门）
    /// - qty: 交接数量（不超过未交接产出）
    /// - batch_id: 批次号（必须与生产批次一致）
    ///
    /// # 返回
    /// - Ok(InitiateOutcome): blocked = true 时交接为 BLOCKED，产线不变
    #[instrument(skip(self))]
    pub fn initiate_transfer(
        &self,
        from_task_id: &str,
        dest: Department,
        qty: Qty,
        batch_id: &str,
    ) -> EngineResult<InitiateOutcome> {
        let _guards = self
            .locks
            .lock_many(vec![task_key(from_task_id), line_key(dest)]);
        let mut outbox = AlertOutbox::new();
        let outcome = self.uow.run(|tx| {
            initiate_in(tx, from_task_id, dest, qty, batch_id, None, Self::now(), &mut outbox)
        })?;
        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            transfer_id = %outcome.transfer.transfer_id,
            state = %outcome.transfer.state,
            dest = %dest,
            qty = %qty,
            "交接已发起"
        );
        Ok(outcome)
    }

    /// 重试 BLOCKED 交接：原记录保持 BLOCKED，新建一次交接尝试
    #[instrument(skip(self))]
    pub fn retry_transfer(&self, transfer_id: &str) -> EngineResult<InitiateOutcome> {
        let original = self.load_transfer(transfer_id)?;
        if original.state != TransferState::Blocked {
            return Err(EngineError::invalid_state(
                "TransferRecord",
                transfer_id,
                original.state,
                "重试",
            ));
        }

        let _guards = self.locks.lock_many(vec![
            task_key(&original.from_task_id),
            line_key(original.to_department),
        ]);
        let mut outbox = AlertOutbox::new();
        let outcome = self.uow.run(|tx| {
            initiate_in(
                tx,
                &original.from_task_id,
                original.to_department,
                original.sent_qty,
                &original.batch_id,
                Some(transfer_id),
                Self::now(),
                &mut outbox,
            )
        })?;
        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            retry_of = transfer_id,
            transfer_id = %outcome.transfer.transfer_id,
            blocked = outcome.blocked,
            "交接重试"
        );
        Ok(outcome)
    }

    /// 接收确认
    ///
    /// # 返回
    /// - accepted = false: 差异超出接收部门容差，交接保持 LOCKED 并告警
    /// - accepted = true: ACCEPTED，接收工单投入增加，PENDING → READY；
    ///   批次已关闭时只登记实收，产线可随后 complete 释放
    #[instrument(skip(self))]
    pub fn accept_transfer(&self, transfer_id: &str, received_qty: Qty) -> EngineResult<AcceptOutcome> {
        if received_qty.is_negative() {
            return Err(EngineError::InvalidInput(format!("接收数量不能为负: {}", received_qty)));
        }
        require_within_limit(received_qty, "接收")?;
        let policy = self.load_policy()?;
        let snapshot = self.load_transfer(transfer_id)?;

        let _guards = self.locks.lock_many(vec![
            task_key(&snapshot.from_task_id),
            task_key(&snapshot.to_task_id),
        ]);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let mut transfer = TransferRepository::get_transfer_in(tx, transfer_id)?;
            if transfer.state != TransferState::Locked {
                return Err(EngineError::invalid_state(
                    "TransferRecord",
                    transfer_id,
                    transfer.state,
                    "接收",
                ));
            }
            let mut receiver = ProductionRepository::get_task_in(tx, &transfer.to_task_id)?;
            let run = ProductionRepository::get_run_in(tx, &receiver.run_id)?;

            let tolerance_pct = policy.tolerance_pct(transfer.to_department);
            if exceeds_tolerance(transfer.sent_qty, received_qty, tolerance_pct) {
                transfer.mismatch_count += 1;
                transfer.last_rejected_qty = Some(received_qty);
                TransferRepository::update_transfer_in(tx, &mut transfer)?;

                outbox.raise_in(
                    tx,
                    Alert::new(
                        AlertType::QuantityMismatch,
                        AlertSeverity::Warning,
                        "TRANSFER",
                        transfer_id,
                        format!(
                            "交接数量差异超限: 发出 {}, 实收 {}, 容差 {}%",
                            transfer.sent_qty, received_qty, tolerance_pct
                        ),
                        now,
                    )
                    .with_department(transfer.to_department)
                    .with_recipient(&department_recipient(transfer.from_department))
                    .with_recipient(SUPERVISOR_ROLE)
                    .with_payload(json!({
                        "sent": transfer.sent_qty,
                        "received": received_qty,
                        "tolerance_pct": tolerance_pct,
                        "mismatch_count": transfer.mismatch_count,
                    })),
                )?;

                return Ok(AcceptOutcome {
                    transfer,
                    accepted: false,
                    tolerance_pct,
                });
            }

            transfer.state = TransferState::Accepted;
            transfer.received_qty = Some(received_qty);
            transfer.accepted_at = Some(now);
            TransferRepository::update_transfer_in(tx, &mut transfer)?;

            if run.state.is_closed() {
                tracing::warn!(
                    transfer_id,
                    run_id = %run.run_id,
                    run_state = %run.state,
                    "批次已关闭，仅登记在途物料实收"
                );
            } else {
                receiver.input_qty += received_qty;
                if receiver.state == TaskState::Pending {
                    receiver.state = TaskState::Ready;
                }
                receiver.updated_at = now;
                ProductionRepository::update_task_in(tx, &mut receiver)?;
            }

            Ok(AcceptOutcome {
                transfer,
                accepted: true,
                tolerance_pct,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            transfer_id,
            received = %received_qty,
            accepted = outcome.accepted,
            "交接接收确认"
        );
        Ok(outcome)
    }

    /// 发出方更正 LOCKED 交接的发出数量
    #[instrument(skip(self))]
    pub fn correct_transfer(&self, transfer_id: &str, corrected_qty: Qty) -> EngineResult<TransferRecord> {
        if !corrected_qty.is_positive() {
            return Err(EngineError::InvalidInput(format!(
                "更正数量必须大于0: {}",
                corrected_qty
            )));
        }
        require_within_limit(corrected_qty, "更正")?;
        let snapshot = self.load_transfer(transfer_id)?;
        let _guard = self.locks.lock(&task_key(&snapshot.from_task_id));

        let transfer = self.uow.run(|tx| {
            let mut transfer = TransferRepository::get_transfer_in(tx, transfer_id)?;
            if transfer.state != TransferState::Locked {
                return Err(EngineError::invalid_state(
                    "TransferRecord",
                    transfer_id,
                    transfer.state,
                    "更正",
                ));
            }
            let sender = ProductionRepository::get_task_in(tx, &transfer.from_task_id)?;
            let held_elsewhere =
                TransferRepository::held_output_in(tx, &transfer.from_task_id)? - transfer.sent_qty;
            let available = sender.actual_output_qty - held_elsewhere;
            if corrected_qty > available {
                return Err(EngineError::TransferQtyExceeded {
                    task_id: transfer.from_task_id.clone(),
                    requested: corrected_qty,
                    available,
                });
            }

            transfer.sent_qty = corrected_qty;
            TransferRepository::update_transfer_in(tx, &mut transfer)?;
            Ok(transfer)
        })?;

        tracing::info!(transfer_id, corrected = %corrected_qty, "交接发出数量已更正");
        Ok(transfer)
    }

    /// 完成交接
    ///
    /// 同批次在该产线上没有其他 LOCKED/ACCEPTED 交接时释放产线
    #[instrument(skip(self))]
    pub fn complete_transfer(&self, transfer_id: &str) -> EngineResult<CompleteOutcome> {
        let snapshot = self.load_transfer(transfer_id)?;
        let _guards = self.locks.lock_many(vec![
            task_key(&snapshot.to_task_id),
            line_key(snapshot.to_department),
        ]);
        let now = Self::now();
        let mut outbox = AlertOutbox::new();

        let outcome = self.uow.run(|tx| {
            let mut transfer = TransferRepository::get_transfer_in(tx, transfer_id)?;
            if transfer.state != TransferState::Accepted {
                return Err(EngineError::invalid_state(
                    "TransferRecord",
                    transfer_id,
                    transfer.state,
                    "完成",
                ));
            }
            transfer.state = TransferState::Completed;
            transfer.completed_at = Some(now);
            TransferRepository::update_transfer_in(tx, &mut transfer)?;

            let mut line = TransferRepository::get_line_in(tx, transfer.to_department)?;
            let mut line_released = false;
            let same_batch = line.batch_id.as_deref() == Some(transfer.batch_id.as_str());
            if same_batch
                && TransferRepository::count_line_holders_in(
                    tx,
                    transfer.to_department,
                    &transfer.batch_id,
                    transfer_id,
                )? == 0
            {
                line.batch_id = None;
                if line.state != LineState::Paused {
                    line.state = LineState::Clear;
                }
                line.updated_at = now;
                TransferRepository::update_line_in(tx, &mut line)?;
                line_released = true;
                notify_line_cleared_in(tx, &line, now, &mut outbox)?;
            }

            Ok(CompleteOutcome {
                transfer,
                line: LineStatus::from(&line),
                line_released,
            })
        })?;

        self.alerts.publish_all(outbox.alerts());
        tracing::info!(
            transfer_id,
            line_released = outcome.line_released,
            line_state = %outcome.line.state,
            "交接完成"
        );
        Ok(outcome)
    }

    /// 主管暂停产线（暂停期间所有交接 BLOCKED）
    #[instrument(skip(self))]
    pub fn pause_line(&self, department: Department) -> EngineResult<LineStatus> {
        let _guard = self.locks.lock(&line_key(department));
        let line = self.uow.run(|tx| {
            let mut line = TransferRepository::get_line_in(tx, department)?;
            if line.state == LineState::Paused {
                return Err(EngineError::invalid_state("LineOccupancy", department.to_db_str(), line.state, "暂停"));
            }
            line.state = LineState::Paused;
            line.updated_at = Self::now();
            TransferRepository::update_line_in(tx, &mut line)?;
            Ok(LineStatus::from(&line))
        })?;
        tracing::warn!(department = %department, "产线已暂停");
        Ok(line)
    }

    /// 主管恢复产线：仍有批次占用则恢复 OCCUPIED，否则 CLEAR
    #[instrument(skip(self))]
    pub fn resume_line(&self, department: Department) -> EngineResult<LineStatus> {
        let _guard = self.locks.lock(&line_key(department));
        let now = Self::now();
        let mut outbox = AlertOutbox::new();
        let line = self.uow.run(|tx| {
            let mut line = TransferRepository::get_line_in(tx, department)?;
            if line.state != LineState::Paused {
                return Err(EngineError::invalid_state("LineOccupancy", department.to_db_str(), line.state, "恢复"));
            }
            let staged = match line.batch_id.as_deref() {
                Some(batch) => TransferRepository::count_line_holders_in(tx, department, batch, "")? > 0,
                None => false,
            };
            if staged {
                line.state = LineState::Occupied;
            } else {
                line.state = LineState::Clear;
                line.batch_id = None;
            }
            line.updated_at = now;
            TransferRepository::update_line_in(tx, &mut line)?;
            notify_line_cleared_in(tx, &line, now, &mut outbox)?;
            Ok(LineStatus::from(&line))
        })?;
        self.alerts.publish_all(outbox.alerts());
        tracing::info!(department = %department, state = %line.state, "产线已恢复");
        Ok(line)
    }

    /// 扫描长时间停留在 LOCKED 的交接，每条只告警一次
    ///
    /// # 返回
    /// - 本次新告警的交接
    #[instrument(skip(self))]
    pub fn scan_stale_transfers(&self, now: NaiveDateTime) -> EngineResult<Vec<TransferRecord>> {
        let policy = self.load_policy()?;
        let threshold = now - Duration::minutes(policy.stale_transfer_minutes);
        let candidates = self
            .uow
            .read(|conn| TransferRepository::stale_locked_in(conn, threshold))?;

        let mut alerted = Vec::new();
        for candidate in candidates {
            let _guards = self.locks.lock_many(vec![
                task_key(&candidate.from_task_id),
                task_key(&candidate.to_task_id),
            ]);
            let mut outbox = AlertOutbox::new();
            let result = self.uow.run(|tx| -> EngineResult<Option<TransferRecord>> {
                let mut transfer = TransferRepository::get_transfer_in(tx, &candidate.transfer_id)?;
                if transfer.state != TransferState::Locked || transfer.stale_alerted_at.is_some() {
                    return Ok(None);
                }
                transfer.stale_alerted_at = Some(now);
                TransferRepository::update_transfer_in(tx, &mut transfer)?;

                let minutes = transfer
                    .locked_at
                    .map(|t| (now - t).num_minutes())
                    .unwrap_or_default();
                outbox.raise_in(
                    tx,
                    Alert::new(
                        AlertType::StaleTransfer,
                        AlertSeverity::Warning,
                        "TRANSFER",
                        &transfer.transfer_id,
                        format!(
                            "{} → {} 的交接已锁定 {} 分钟未接收",
                            transfer.from_department, transfer.to_department, minutes
                        ),
                        now,
                    )
                    .with_department(transfer.to_department)
                    .with_recipient(&department_recipient(transfer.from_department))
                    .with_recipient(SUPERVISOR_ROLE)
                    .with_payload(json!({
                        "locked_minutes": minutes,
                        "threshold_minutes": policy.stale_transfer_minutes,
                    })),
                )?;
                Ok(Some(transfer))
            });

            match result {
                Ok(Some(transfer)) => {
                    self.alerts.publish_all(outbox.alerts());
                    alerted.push(transfer);
                }
                Ok(None) => {}
                Err(EngineError::Repository(RepositoryError::OptimisticLockFailure { .. })) => {
                    tracing::warn!(
                        transfer_id = %candidate.transfer_id,
                        "超时扫描遇到并发更新，跳过"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !alerted.is_empty() {
            tracing::warn!(count = alerted.len(), "发现超时未接收的交接");
        }
        Ok(alerted)
    }

    /// 查询产线状态
    pub fn get_line_status(&self, department: Department) -> EngineResult<LineStatus> {
        let line = self
            .uow
            .read(|conn| TransferRepository::get_line_in(conn, department))?;
        Ok(LineStatus::from(&line))
    }
}
