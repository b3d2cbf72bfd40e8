// ==========================================
// 毛绒玩具生产编排核心 - 命令行入口
// ==========================================
// 职责: 打开/初始化数据库，输出各部门产线状态与未结告警数
// 用法: softtoy-production [db_path]
// ==========================================

use anyhow::{Context, Result};
use softtoy_production::app::{get_default_db_path, AppState};
use softtoy_production::repository::alert_repo::AlertFilter;

fn main() -> Result<()> {
    softtoy_production::logging::init();

    let db_path = std::env::args().nth(1).unwrap_or_else(get_default_db_path);
    tracing::info!(version = softtoy_production::VERSION, db_path = %db_path, "启动");

    let state = AppState::new(db_path).map_err(anyhow::Error::msg).context("无法初始化AppState")?;

    println!("==================================================");
    println!("{} v{}", softtoy_production::APP_NAME, softtoy_production::VERSION);
    println!("数据库: {}", state.get_db_path());
    println!("==================================================");

    for line in state.handshake_api.list_lines()? {
        println!(
            "{:<12} {:<10} {}",
            line.department.to_db_str(),
            line.state.to_db_str(),
            line.batch_id.as_deref().unwrap_or("-")
        );
    }

    let open_alerts = state.warehouse_api.list_alerts(&AlertFilter {
        unacknowledged_only: true,
        ..Default::default()
    })?;
    println!("未确认告警: {}", open_alerts.len());

    Ok(())
}
