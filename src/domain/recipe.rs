// ==========================================
// 毛绒玩具生产编排核心 - 配方图领域模型
// ==========================================
// 职责: 成品/工序/物料需求定义（只读主数据）
// 红线: 在制批次绑定创建时的配方版本，配方修改只能发布新版本
// ==========================================

use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::types::{Department, RecipeStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// ==========================================
// 主数据
// ==========================================

/// 成品（可销售的毛绒玩具）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub article_id: String,
    pub name: String,
}

/// 物料主数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub material_id: String,
    pub name: String,
    pub unit_step: Qty, // 最小计量单位（如布料 0.001m，眼珠 1 粒）
}

/// 库位主数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: String,
    pub name: String,
}

// ==========================================
// 配方版本
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeVersion {
    pub recipe_version_id: String,
    pub article_id: String,
    pub version_no: i32,
    pub status: RecipeStatus,
    pub created_at: NaiveDateTime,
}

/// 工序物料需求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRequirement {
    pub material_id: String,
    pub location_id: String, // 领料库位
    pub qty_per_unit: Qty,   // 单件用量
    pub wastage_pct: Qty,    // 损耗百分比 (0-100)
}

/// 配方工序
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStage {
    pub stage_id: String,
    pub department: Department,
    pub seq_no: i32,
    pub input_good: Option<String>, // 入口工序为 None
    pub output_good: String,
    pub optional: bool,
    pub buffer_factor: Option<BufferFactor>, // 覆盖部门默认缓冲系数
    pub requirements: Vec<MaterialRequirement>,
}

// ==========================================
// RecipeGraph - 配方图（某版本的完整工序链）
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeGraph {
    pub version: RecipeVersion,
    pub stages: Vec<RecipeStage>, // 按 seq_no 升序
}

/// 配方结构校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecipeGraphError {
    #[error("配方没有任何工序")]
    Empty,

    #[error("工序序号不连续: 期望 {expected}, 实际 {actual}")]
    SequenceGap { expected: i32, actual: i32 },

    #[error("部门顺序错误: {previous} 之后不能是 {current}")]
    DepartmentOrder {
        previous: Department,
        current: Department,
    },

    #[error("入口工序数量必须为1, 实际 {0}")]
    EntryCount(usize),

    #[error("终端工序数量必须为1, 实际 {0}")]
    TerminalCount(usize),

    #[error("工序 {seq_no} 的投入品 {input} 与上道产出 {expected} 不一致")]
    BrokenLink {
        seq_no: i32,
        input: String,
        expected: String,
    },

    #[error("工序 {seq_no} 的物料需求非法: {reason}")]
    InvalidRequirement { seq_no: i32, reason: String },
}

impl RecipeGraph {
    /// 校验配方图结构
    ///
    /// # 规则
    /// - 序号从 1 开始严格递增且无间隔
    /// - 部门严格递增（每个部门最多一道工序）
    /// - 恰好一个入口工序（投入品为空）
    /// - 恰好一个终端工序（产出不被任何工序投入）
    /// - 每道工序投入品 = 上道工序产出品
    /// - 用量 > 0，损耗 0-100
    pub fn validate(stages: &[RecipeStage]) -> Result<(), RecipeGraphError> {
        if stages.is_empty() {
            return Err(RecipeGraphError::Empty);
        }

        for (idx, stage) in stages.iter().enumerate() {
            let expected = idx as i32 + 1;
            if stage.seq_no != expected {
                return Err(RecipeGraphError::SequenceGap {
                    expected,
                    actual: stage.seq_no,
                });
            }
            if idx > 0 {
                let previous = &stages[idx - 1];
                if stage.department <= previous.department {
                    return Err(RecipeGraphError::DepartmentOrder {
                        previous: previous.department,
                        current: stage.department,
                    });
                }
            }
            for req in &stage.requirements {
                if !req.qty_per_unit.is_positive() {
                    return Err(RecipeGraphError::InvalidRequirement {
                        seq_no: stage.seq_no,
                        reason: format!("{} 单件用量必须大于0", req.material_id),
                    });
                }
                if req.qty_per_unit.exceeds_limit() {
                    return Err(RecipeGraphError::InvalidRequirement {
                        seq_no: stage.seq_no,
                        reason: format!("{} 单件用量超出上限 {}", req.material_id, Qty::MAX),
                    });
                }
                if req.wastage_pct.is_negative() || req.wastage_pct > Qty::from_units(100) {
                    return Err(RecipeGraphError::InvalidRequirement {
                        seq_no: stage.seq_no,
                        reason: format!("{} 损耗率必须在0-100之间", req.material_id),
                    });
                }
            }
        }

        let entry_count = stages.iter().filter(|s| s.input_good.is_none()).count();
        if entry_count != 1 {
            return Err(RecipeGraphError::EntryCount(entry_count));
        }

        let consumed: HashSet<&str> = stages
            .iter()
            .filter_map(|s| s.input_good.as_deref())
            .collect();
        let terminal_count = stages
            .iter()
            .filter(|s| !consumed.contains(s.output_good.as_str()))
            .count();
        if terminal_count != 1 {
            return Err(RecipeGraphError::TerminalCount(terminal_count));
        }

        for pair in stages.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            match cur.input_good.as_deref() {
                Some(input) if input == prev.output_good => {}
                Some(input) => {
                    return Err(RecipeGraphError::BrokenLink {
                        seq_no: cur.seq_no,
                        input: input.to_string(),
                        expected: prev.output_good.clone(),
                    })
                }
                // 入口工序只能是第一道，已由 entry_count 保证
                None => return Err(RecipeGraphError::EntryCount(entry_count + 1)),
            }
        }

        Ok(())
    }

    /// 入口工序
    pub fn entry_stage(&self) -> Option<&RecipeStage> {
        self.stages.iter().find(|s| s.input_good.is_none())
    }

    /// 终端工序
    pub fn terminal_stage(&self) -> Option<&RecipeStage> {
        self.stages.last()
    }

    /// 按部门查找工序
    pub fn stage_for(&self, department: Department) -> Option<&RecipeStage> {
        self.stages.iter().find(|s| s.department == department)
    }
}
