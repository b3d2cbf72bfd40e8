// ==========================================
// 引擎单元测试公共夹具（仅测试编译）
// ==========================================
// 成品 BEAR: CUTTING → EMBROIDERY → SEWING
// 缓冲: 1.100 / 1.050 / 1.000（缝制工序覆盖）
// ==========================================

use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::recipe::{Article, Location, Material, MaterialRequirement, RecipeStage};
use crate::domain::types::Department;
use crate::repository::{MasterdataRepository, RecipeRepository};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

pub(crate) const ARTICLE: &str = "BEAR";
pub(crate) const LOCATION: &str = "WH-A";

pub(crate) fn q(s: &str) -> Qty {
    s.parse().unwrap()
}

pub(crate) fn memory_conn() -> Arc<Mutex<Connection>> {
    let conn = Connection::open_in_memory().unwrap();
    crate::db::configure_sqlite_connection(&conn).unwrap();
    crate::db::init_schema(&conn).unwrap();
    Arc::new(Mutex::new(conn))
}

fn requirement(material_id: &str, qty_per_unit: &str, wastage_pct: &str) -> MaterialRequirement {
    MaterialRequirement {
        material_id: material_id.to_string(),
        location_id: LOCATION.to_string(),
        qty_per_unit: q(qty_per_unit),
        wastage_pct: q(wastage_pct),
    }
}

pub(crate) fn bear_stages() -> Vec<RecipeStage> {
    vec![
        RecipeStage {
            stage_id: String::new(),
            department: Department::Cutting,
            seq_no: 1,
            input_good: None,
            output_good: "BEAR-PANELS".to_string(),
            optional: false,
            buffer_factor: None,
            requirements: vec![requirement("PLUSH", "0.5", "5")],
        },
        RecipeStage {
            stage_id: String::new(),
            department: Department::Embroidery,
            seq_no: 2,
            input_good: Some("BEAR-PANELS".to_string()),
            output_good: "BEAR-FACES".to_string(),
            optional: true,
            buffer_factor: None,
            requirements: vec![requirement("THREAD", "2", "0")],
        },
        RecipeStage {
            stage_id: String::new(),
            department: Department::Sewing,
            seq_no: 3,
            input_good: Some("BEAR-FACES".to_string()),
            output_good: "BEAR".to_string(),
            optional: false,
            buffer_factor: Some(BufferFactor::ONE),
            requirements: vec![requirement("FIBER", "0.2", "10"), requirement("EYE", "2", "0")],
        },
    ]
}

/// 建库并发布 BEAR 配方；PLUSH 入库 on_hand 由调用方决定
pub(crate) fn seed_bear(conn: &Arc<Mutex<Connection>>) {
    let now = chrono::Utc::now().naive_utc();
    let md = MasterdataRepository::new(conn.clone());
    md.upsert_location(
        &Location {
            location_id: LOCATION.to_string(),
            name: "主仓".to_string(),
        },
        now,
    )
    .unwrap();
    for (id, step) in [("PLUSH", "0.001"), ("THREAD", "0.001"), ("FIBER", "0.001"), ("EYE", "1")] {
        md.upsert_material(
            &Material {
                material_id: id.to_string(),
                name: id.to_string(),
                unit_step: q(step),
            },
            now,
        )
        .unwrap();
    }
    md.upsert_article(
        &Article {
            article_id: ARTICLE.to_string(),
            name: "泰迪熊".to_string(),
        },
        now,
    )
    .unwrap();

    RecipeRepository::new(conn.clone())
        .publish_version(ARTICLE, &bear_stages(), now)
        .unwrap();
}
