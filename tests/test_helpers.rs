// ==========================================
// 测试辅助函数
// ==========================================
// 职责: 临时数据库 + AppState 装配、BEAR 配方与库存准备、常用工序推进
// 配方: CUTTING(1.10) → EMBROIDERY(1.05, 可选) → SEWING(1.00 工序覆盖)
// ==========================================

#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;

use softtoy_production::api::StageInput;
use softtoy_production::app::AppState;
use softtoy_production::domain::recipe::MaterialRequirement;
use softtoy_production::domain::BufferFactor;
use softtoy_production::engine::{AlertPublisher, GenerationOutcome};
use softtoy_production::{Department, Qty, RunOptions};
use tempfile::NamedTempFile;

pub const ARTICLE: &str = "BEAR";
pub const LOCATION: &str = "WH-A";
pub const OPERATOR: &str = "tester";

/// 解析数量字面量
pub fn q(s: &str) -> Qty {
    s.parse().unwrap()
}

/// 创建临时数据库文件
///
/// # 返回
/// - NamedTempFile: 临时数据库文件（需要保持存活）
/// - String: 数据库文件路径
pub fn create_test_db() -> Result<(NamedTempFile, String), Box<dyn Error>> {
    softtoy_production::logging::init_test();
    let temp_file = NamedTempFile::new()?;
    let db_path = temp_file.path().to_str().unwrap().to_string();
    Ok((temp_file, db_path))
}

/// 创建临时数据库并装配 AppState（自动建库）
pub fn create_test_state() -> (NamedTempFile, AppState) {
    let (temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let state = AppState::new(db_path).expect("Failed to create AppState");
    (temp_file, state)
}

/// 创建带告警推送的 AppState
pub fn create_test_state_with_publisher(publisher: Arc<dyn AlertPublisher>) -> (NamedTempFile, AppState) {
    let (temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let state = AppState::with_publisher(db_path, publisher).expect("Failed to create AppState");
    (temp_file, state)
}

fn requirement(material_id: &str, qty_per_unit: &str, wastage_pct: &str) -> MaterialRequirement {
    MaterialRequirement {
        material_id: material_id.to_string(),
        location_id: LOCATION.to_string(),
        qty_per_unit: q(qty_per_unit),
        wastage_pct: q(wastage_pct),
    }
}

/// BEAR 配方工序录入
pub fn bear_stages() -> Vec<StageInput> {
    vec![
        StageInput {
            department: Department::Cutting,
            input_good: None,
            output_good: "BEAR-PANELS".to_string(),
            optional: false,
            buffer_factor: None,
            requirements: vec![requirement("PLUSH", "0.5", "5")],
        },
        StageInput {
            department: Department::Embroidery,
            input_good: Some("BEAR-PANELS".to_string()),
            output_good: "BEAR-FACES".to_string(),
            optional: true,
            buffer_factor: None,
            requirements: vec![requirement("THREAD", "2", "0")],
        },
        StageInput {
            department: Department::Sewing,
            input_good: Some("BEAR-FACES".to_string()),
            output_good: "BEAR".to_string(),
            optional: false,
            buffer_factor: Some(BufferFactor::ONE),
            requirements: vec![requirement("FIBER", "0.2", "10"), requirement("EYE", "2", "0")],
        },
    ]
}

/// 登记库位/物料/成品（不发布配方、不入库）
pub fn register_masterdata(state: &AppState) {
    let md = &state.masterdata_api;
    md.register_location(LOCATION, "主仓", OPERATOR).unwrap();
    for (id, name, step) in [
        ("PLUSH", "短毛绒面料", "0.001"),
        ("THREAD", "绣花线", "0.001"),
        ("FIBER", "PP棉", "0.001"),
        ("EYE", "安全眼", "1"),
    ] {
        md.register_material(id, name, q(step), OPERATOR).unwrap();
    }
    md.register_article(ARTICLE, "泰迪熊", OPERATOR).unwrap();
}

/// 登记主数据并发布 BEAR 配方
pub fn seed_bear(state: &AppState) {
    register_masterdata(state);
    state
        .masterdata_api
        .publish_recipe(ARTICLE, bear_stages(), OPERATOR)
        .unwrap();
}

/// 发布配方并给全部物料备足库存
pub fn seed_bear_with_stock(state: &AppState) {
    seed_bear(state);
    for (id, qty) in [("PLUSH", "10000"), ("THREAD", "10000"), ("FIBER", "10000"), ("EYE", "10000")] {
        state.warehouse_api.receive(id, LOCATION, q(qty), OPERATOR).unwrap();
    }
}

/// 生成 BEAR 批次（默认含可选工序）
pub fn generate(state: &AppState, qty: &str) -> GenerationOutcome {
    state
        .production_api
        .generate_run(ARTICLE, q(qty), OPERATOR, RunOptions::default())
        .unwrap()
}

/// 开工并按目标件数报工，返回完工后的工单目标
pub fn run_to_target(state: &AppState, task_id: &str) -> Qty {
    let task = state.production_api.start_task(task_id, OPERATOR).unwrap();
    state
        .production_api
        .record_task_output(task_id, task.target_qty, Qty::ZERO, OPERATOR)
        .unwrap();
    task.target_qty
}

/// 把完工工单的全部产出交给下道工序（发起 → 接收 → 完成）
pub fn hand_over(state: &AppState, from_task_id: &str, dest: Department, qty: Qty, batch_id: &str) {
    let hs = &state.handshake_api;
    let init = hs
        .initiate_transfer(from_task_id, dest, qty, batch_id, OPERATOR)
        .unwrap();
    assert!(!init.blocked, "交接被阻断: {:?}", init.transfer.block_reason);
    let accepted = hs
        .accept_transfer(&init.transfer.transfer_id, qty, OPERATOR)
        .unwrap();
    assert!(accepted.accepted);
    hs.complete_transfer(&init.transfer.transfer_id, OPERATOR).unwrap();
}
