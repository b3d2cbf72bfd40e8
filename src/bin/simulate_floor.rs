// ==========================================
// 毛绒玩具生产编排核心 - 车间仿真
// ==========================================
// 职责: 建演示配方与库存，按部门启动并发 worker 跑完若干批次
// 用法: simulate_floor [runs] [qty] [db_path]
// 说明: 每个部门一个 tokio 任务；主管 worker 负责审批短缺与超时扫描
// ==========================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use softtoy_production::api::StageInput;
use softtoy_production::app::AppState;
use softtoy_production::domain::recipe::MaterialRequirement;
use softtoy_production::domain::types::{
    ApprovalDecision, ApprovalStatus, Department, RunState, TaskState, TransferState,
};
use softtoy_production::engine::{CollectingAlertPublisher, RunOptions};
use softtoy_production::Qty;

const ARTICLE: &str = "TEDDY-30";
const LOCATION: &str = "WH-MAIN";
const TICK: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(60);

fn qty(s: &str) -> Result<Qty> {
    s.parse::<Qty>().with_context(|| format!("数量格式错误: {}", s))
}

fn requirement(material_id: &str, per_unit: &str, wastage: &str) -> Result<MaterialRequirement> {
    Ok(MaterialRequirement {
        material_id: material_id.to_string(),
        location_id: LOCATION.to_string(),
        qty_per_unit: qty(per_unit)?,
        wastage_pct: qty(wastage)?,
    })
}

/// 建演示主数据、配方与初始库存
fn seed(state: &AppState) -> Result<()> {
    let md = &state.masterdata_api;
    md.register_location(LOCATION, "主仓", "sim")?;
    for (id, name, step) in [
        ("PLUSH", "短毛绒面料(m)", "0.001"),
        ("THREAD", "绣花线(m)", "0.001"),
        ("FIBER", "PP棉(kg)", "0.001"),
        ("EYE", "安全眼(粒)", "1"),
        ("BOX", "彩盒(个)", "1"),
    ] {
        md.register_material(id, name, qty(step)?, "sim")?;
    }
    md.register_article(ARTICLE, "30cm 泰迪熊", "sim")?;

    let stage = |dept: Department, input: Option<&str>, output: &str, reqs: Vec<MaterialRequirement>| StageInput {
        department: dept,
        input_good: input.map(str::to_string),
        output_good: output.to_string(),
        optional: dept == Department::Embroidery,
        buffer_factor: None,
        requirements: reqs,
    };
    let stages = vec![
        stage(Department::Cutting, None, "PANELS", vec![requirement("PLUSH", "0.35", "5")?]),
        stage(Department::Embroidery, Some("PANELS"), "FACES", vec![requirement("THREAD", "1.5", "0")?]),
        stage(Department::Sewing, Some("FACES"), "SHELLS", vec![requirement("EYE", "2", "0")?]),
        stage(Department::Finishing, Some("SHELLS"), "BEARS", vec![requirement("FIBER", "0.12", "3")?]),
        stage(Department::Packing, Some("BEARS"), "BOXED", vec![requirement("BOX", "1", "0")?]),
    ];
    md.publish_recipe(ARTICLE, stages, "sim")?;

    let wh = &state.warehouse_api;
    for (id, on_hand) in [("PLUSH", "2000"), ("THREAD", "5000"), ("FIBER", "300"), ("EYE", "5000"), ("BOX", "1500")] {
        wh.receive(id, LOCATION, qty(on_hand)?, "sim")?;
    }
    Ok(())
}

/// 部门 worker 的本地记忆（已发起交接的工单、已重试的交接）
#[derive(Default)]
struct WorkerMemo {
    shipped: HashSet<String>,
    retried: HashSet<String>,
    short_once: HashSet<String>,
}

/// 部门 worker 单步：收货 → 开工 → 报工 → 发货
fn department_tick(state: &AppState, dept: Department, memo: &mut WorkerMemo) -> Result<()> {
    let hs = &state.handshake_api;
    let prod = &state.production_api;
    let worker = format!("{}-worker", dept.to_db_str().to_lowercase());

    // 收货
    for t in hs.list_transfers(Some(dept), Some(TransferState::Locked))? {
        let out = hs.accept_transfer(&t.transfer_id, t.sent_qty, &worker)?;
        if out.accepted {
            hs.complete_transfer(&t.transfer_id, &worker)?;
        }
    }

    // 开工
    for task in prod.list_department_tasks(dept, Some(TaskState::Ready))? {
        if let Err(e) = prod.start_task(&task.task_id, &worker) {
            tracing::debug!(task_id = %task.task_id, error = %e, "暂不能开工");
        }
    }

    // 报工（切裁首次少报 1 件，走短缺审批）
    for task in prod.list_department_tasks(dept, Some(TaskState::Running))? {
        let mut remaining = (task.target_qty - task.actual_output_qty).non_negative();
        if dept == Department::Cutting && memo.short_once.insert(task.task_id.clone()) {
            remaining -= Qty::from_units(1);
        }
        prod.record_task_output(&task.task_id, remaining, Qty::ZERO, &worker)?;
    }

    // 发货
    for task in prod.list_department_tasks(dept, Some(TaskState::Finished))? {
        if memo.shipped.contains(&task.task_id) {
            continue;
        }
        let detail = prod.get_run(&task.run_id)?;
        if detail.run.state == RunState::Cancelled {
            continue;
        }
        let Some(next) = detail
            .tasks
            .iter()
            .find(|t| t.predecessor_task_id.as_deref() == Some(task.task_id.as_str()))
        else {
            memo.shipped.insert(task.task_id.clone());
            continue;
        };
        let out = hs.initiate_transfer(
            &task.task_id,
            next.department,
            task.actual_output_qty,
            &detail.run.batch_id,
            &worker,
        )?;
        memo.shipped.insert(task.task_id.clone());
        if out.blocked {
            tracing::info!(batch_id = %detail.run.batch_id, to = %next.department, "目标产线占用，等待重试");
        }
    }

    // 重试被阻断的发货
    for t in hs.list_transfers(None, Some(TransferState::Blocked))? {
        if t.from_department != dept || memo.retried.contains(&t.transfer_id) {
            continue;
        }
        let line = hs.get_line_status(t.to_department)?;
        if line.batch_id.is_some() && line.batch_id.as_deref() != Some(t.batch_id.as_str()) {
            continue;
        }
        memo.retried.insert(t.transfer_id.clone());
        hs.retry_transfer(&t.transfer_id, &worker)?;
    }
    Ok(())
}

/// 主管 worker 单步：批准短缺、扫描超时交接
fn supervisor_tick(state: &AppState) -> Result<()> {
    for approval in state
        .production_api
        .list_approvals(Some(ApprovalStatus::Pending))?
    {
        state.production_api.resolve_approval(
            &approval.approval_id,
            ApprovalDecision::Approved,
            "supervisor",
            Some("仿真自动批准"),
        )?;
    }
    state.handshake_api.scan_stale_transfers()?;
    Ok(())
}

fn all_done(state: &AppState, run_ids: &[String]) -> Result<bool> {
    for id in run_ids {
        if state.production_api.get_run(id)?.run.state != RunState::Done {
            return Ok(false);
        }
    }
    Ok(true)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    softtoy_production::logging::init();

    let mut args = std::env::args().skip(1);
    let runs: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(2);
    let per_run = qty(&args.next().unwrap_or_else(|| "200".to_string()))?;
    let db_path = args.next().unwrap_or_else(|| {
        std::env::temp_dir()
            .join(format!("softtoy_sim_{}.db", uuid::Uuid::new_v4().simple()))
            .to_string_lossy()
            .to_string()
    });

    let alerts = Arc::new(CollectingAlertPublisher::new());
    let state = Arc::new(
        AppState::with_publisher(db_path.clone(), alerts.clone()).map_err(anyhow::Error::msg)?,
    );
    seed(&state)?;

    let mut run_ids = Vec::with_capacity(runs);
    for _ in 0..runs {
        let out = state
            .production_api
            .generate_run(ARTICLE, per_run, "planner", RunOptions::default())?;
        tracing::info!(
            batch_id = %out.run.batch_id,
            targets = ?out.tasks.iter().map(|t| t.target_qty.to_string()).collect::<Vec<_>>(),
            "批次已分解"
        );
        run_ids.push(out.run.run_id);
    }

    let started = std::time::Instant::now();
    let mut handles = Vec::new();
    for dept in Department::ALL {
        let state = state.clone();
        let run_ids = run_ids.clone();
        handles.push(tokio::spawn(async move {
            let mut memo = WorkerMemo::default();
            loop {
                let st = state.clone();
                let (m, result) = tokio::task::spawn_blocking(move || {
                    let r = department_tick(&st, dept, &mut memo);
                    (memo, r)
                })
                .await?;
                memo = m;
                result?;
                if all_done(&state, &run_ids)? || started.elapsed() > DEADLINE {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(TICK).await;
            }
        }));
    }
    {
        let state = state.clone();
        let run_ids = run_ids.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let st = state.clone();
                tokio::task::spawn_blocking(move || supervisor_tick(&st)).await??;
                if all_done(&state, &run_ids)? || started.elapsed() > DEADLINE {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(TICK * 5).await;
            }
        }));
    }
    for h in handles {
        h.await??;
    }

    if !all_done(&state, &run_ids)? {
        bail!("仿真超时：仍有批次未完成");
    }

    // 汇总
    let mut by_type: HashMap<String, usize> = HashMap::new();
    for a in alerts.drain() {
        *by_type.entry(a.alert_type.to_string()).or_default() += 1;
    }
    println!("数据库: {}", db_path);
    println!("完成批次: {} × {} 件, 用时 {:?}", runs, per_run, started.elapsed());
    for line in state.handshake_api.list_lines()? {
        println!("  产线 {:<12} {}", line.department.to_db_str(), line.state.to_db_str());
    }
    for pos in state.warehouse_api.list_positions(None)? {
        println!(
            "  {:<8} 在库 {:>10} 预留 {:>10} 已耗 {:>10}",
            pos.material_id,
            pos.on_hand.to_string(),
            pos.reserved.to_string(),
            pos.consumed.to_string()
        );
    }
    for (t, n) in by_type {
        println!("  告警 {:<28} {}", t, n);
    }
    Ok(())
}
