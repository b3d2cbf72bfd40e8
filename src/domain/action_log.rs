// ==========================================
// 毛绒玩具生产编排核心 - 操作日志领域模型
// ==========================================
// 红线: 所有写操作必须记录
// 用途: 审计追踪
// ==========================================

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// ActionLog - 操作日志
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub action_id: String,
    pub action_type: String,   // 操作类型 (存储为字符串)
    pub action_ts: NaiveDateTime,
    pub actor: String,
    pub ref_type: Option<String>, // 关联实体类型
    pub ref_id: Option<String>,   // 关联实体ID
    pub payload_json: Option<JsonValue>,
    pub detail: Option<String>,
}

// ==========================================
// ActionType - 操作类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    // ===== 主数据 =====
    RegisterMaterial,
    RegisterLocation,
    RegisterArticle,
    PublishRecipe,
    // ===== 台账 =====
    Reserve,
    Consume,
    Receive,
    Release,
    WriteOffDebt,
    AcknowledgeAlert,
    // ===== 批次/工单 =====
    GenerateRun,
    StartTask,
    RecordOutput,
    ResolveApproval,
    UnblockTask,
    CancelRun,
    // ===== 交接 =====
    InitiateTransfer,
    AcceptTransfer,
    CorrectTransfer,
    CompleteTransfer,
    RetryTransfer,
    PauseLine,
    ResumeLine,
    // ===== 配置 =====
    UpdateConfig,
}

impl ActionType {
    /// 转换为字符串 (用于数据库存储)
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RegisterMaterial => "RegisterMaterial",
            ActionType::RegisterLocation => "RegisterLocation",
            ActionType::RegisterArticle => "RegisterArticle",
            ActionType::PublishRecipe => "PublishRecipe",
            ActionType::Reserve => "Reserve",
            ActionType::Consume => "Consume",
            ActionType::Receive => "Receive",
            ActionType::Release => "Release",
            ActionType::WriteOffDebt => "WriteOffDebt",
            ActionType::AcknowledgeAlert => "AcknowledgeAlert",
            ActionType::GenerateRun => "GenerateRun",
            ActionType::StartTask => "StartTask",
            ActionType::RecordOutput => "RecordOutput",
            ActionType::ResolveApproval => "ResolveApproval",
            ActionType::UnblockTask => "UnblockTask",
            ActionType::CancelRun => "CancelRun",
            ActionType::InitiateTransfer => "InitiateTransfer",
            ActionType::AcceptTransfer => "AcceptTransfer",
            ActionType::CorrectTransfer => "CorrectTransfer",
            ActionType::CompleteTransfer => "CompleteTransfer",
            ActionType::RetryTransfer => "RetryTransfer",
            ActionType::PauseLine => "PauseLine",
            ActionType::ResumeLine => "ResumeLine",
            ActionType::UpdateConfig => "UpdateConfig",
        }
    }
}

impl ActionLog {
    /// 构造操作日志
    pub fn new(action_type: ActionType, actor: &str, now: NaiveDateTime) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.as_str().to_string(),
            action_ts: now,
            actor: actor.to_string(),
            ref_type: None,
            ref_id: None,
            payload_json: None,
            detail: None,
        }
    }

    pub fn with_ref(mut self, ref_type: &str, ref_id: &str) -> Self {
        self.ref_type = Some(ref_type.to_string());
        self.ref_id = Some(ref_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload_json = Some(payload);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
