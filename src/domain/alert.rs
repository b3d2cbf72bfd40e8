// ==========================================
// 毛绒玩具生产编排核心 - 告警领域模型
// ==========================================
// 红线: 每个 BLOCKED / 产生欠账的状态转换都必须落一条告警
// 消费方: 外部通知服务（按 recipients 路由）
// ==========================================

use crate::domain::types::{AlertSeverity, AlertType, Department};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 主管角色收件人
pub const SUPERVISOR_ROLE: &str = "role:SUPERVISOR";
/// 仓储角色收件人
pub const WAREHOUSE_ROLE: &str = "role:WAREHOUSE";

/// 部门收件人标识
pub fn department_recipient(department: Department) -> String {
    format!("dept:{}", department.to_db_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub department: Option<Department>,
    pub recipients: Vec<String>,
    pub ref_type: String, // TASK / TRANSFER / DEBT / RUN / LINE
    pub ref_id: String,
    pub message: String,
    pub payload_json: Option<JsonValue>,
    pub created_at: NaiveDateTime,
    pub acknowledged: bool,
}

impl Alert {
    /// 构造新告警（alert_id 由 uuid 生成）
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        ref_type: &str,
        ref_id: &str,
        message: String,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            severity,
            department: None,
            recipients: Vec::new(),
            ref_type: ref_type.to_string(),
            ref_id: ref_id.to_string(),
            message,
            payload_json: None,
            created_at: now,
            acknowledged: false,
        }
    }

    pub fn with_department(mut self, department: Department) -> Self {
        self.department = Some(department);
        self.recipients.push(department_recipient(department));
        self
    }

    pub fn with_recipient(mut self, recipient: &str) -> Self {
        if !self.recipients.iter().any(|r| r == recipient) {
            self.recipients.push(recipient.to_string());
        }
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload_json = Some(payload);
        self
    }
}
