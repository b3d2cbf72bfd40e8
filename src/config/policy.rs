// ==========================================
// 毛绒玩具生产编排核心 - 编排策略
// ==========================================
// 职责: 按部门命名的阈值快照 + 读取接口
// 红线: 引擎只依赖 PolicyReader，不直接读 config_kv
// ==========================================

use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::types::Department;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;

/// 默认差异容差（10%）
pub const DEFAULT_VARIANCE_TOLERANCE_PCT: Qty = Qty::from_units(10);

/// 默认交接锁定超时（分钟）
pub const DEFAULT_STALE_TRANSFER_MINUTES: i64 = 240;

/// 部门默认缓冲系数
pub fn default_buffer_factor(department: Department) -> BufferFactor {
    match department {
        Department::Cutting => BufferFactor::from_milli(1_100),
        Department::Embroidery => BufferFactor::from_milli(1_050),
        Department::Sewing => BufferFactor::from_milli(1_067),
        Department::Finishing | Department::Packing => BufferFactor::ONE,
    }
}

// ==========================================
// OrchestrationPolicy - 编排阈值快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    pub buffer_factors: BTreeMap<Department, BufferFactor>,
    pub variance_tolerance_pct: BTreeMap<Department, Qty>,
    pub stale_transfer_minutes: i64,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            buffer_factors: Department::ALL
                .iter()
                .map(|d| (*d, default_buffer_factor(*d)))
                .collect(),
            variance_tolerance_pct: Department::ALL
                .iter()
                .map(|d| (*d, DEFAULT_VARIANCE_TOLERANCE_PCT))
                .collect(),
            stale_transfer_minutes: DEFAULT_STALE_TRANSFER_MINUTES,
        }
    }
}

impl OrchestrationPolicy {
    pub fn buffer_factor(&self, department: Department) -> BufferFactor {
        self.buffer_factors
            .get(&department)
            .copied()
            .unwrap_or_else(|| default_buffer_factor(department))
    }

    /// 接收部门的差异容差（百分比）
    pub fn tolerance_pct(&self, department: Department) -> Qty {
        self.variance_tolerance_pct
            .get(&department)
            .copied()
            .unwrap_or(DEFAULT_VARIANCE_TOLERANCE_PCT)
    }

    pub fn with_buffer_factor(mut self, department: Department, factor: BufferFactor) -> Self {
        self.buffer_factors.insert(department, factor);
        self
    }

    pub fn with_tolerance_pct(mut self, department: Department, pct: Qty) -> Self {
        self.variance_tolerance_pct.insert(department, pct);
        self
    }
}

// ==========================================
// PolicyReader Trait
// ==========================================
// 实现者: ConfigManager（config_kv）、StaticPolicyReader（测试/演示）
pub trait PolicyReader: Send + Sync {
    /// 读取当前阈值快照（缺失或格式错误的键回退默认值）
    fn load_policy(&self) -> Result<OrchestrationPolicy, Box<dyn Error>>;
}

/// 固定策略（不读库）
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyReader {
    policy: OrchestrationPolicy,
}

impl StaticPolicyReader {
    pub fn new(policy: OrchestrationPolicy) -> Self {
        Self { policy }
    }
}

impl PolicyReader for StaticPolicyReader {
    fn load_policy(&self) -> Result<OrchestrationPolicy, Box<dyn Error>> {
        Ok(self.policy.clone())
    }
}
