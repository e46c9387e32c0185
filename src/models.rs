use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// 当前 Unix 时间（秒，带小数），用作有序集合的分数
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 延迟任务
///
/// 序列化后的 JSON 字符串本身就是待执行集合和就绪队列中的成员。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Task {
    pub id: String,
    /// 目标就绪队列名
    pub queue: String,
    /// 处理函数名
    pub handler: String,
    #[schema(value_type = Object)]
    pub args: serde_json::Value,
}

impl Task {
    pub fn new(queue: &str, handler: &str, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            handler: handler.to_string(),
            args,
        }
    }
}

/// 申请锁请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AcquireLockRequest {
    #[schema(example = "checkout")]
    pub name: String,
    #[schema(example = 5000)]
    pub acquire_timeout_ms: u64,
    #[schema(example = 10000)]
    pub hold_timeout_ms: u64,
}

/// 续期请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ExtendLockRequest {
    #[schema(example = "checkout")]
    pub name: String,
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub token: String,
    #[schema(example = 10000)]
    pub hold_timeout_ms: u64,
}

/// 释放请求（锁和信号量共用）
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ReleaseRequest {
    #[schema(example = "checkout")]
    pub name: String,
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub token: String,
}

/// 获取成功响应
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct TokenResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SemaphoreMode {
    Simple,
    #[default]
    Fair,
    /// 公平信号量外加一把短锁
    Locked,
}

/// 申请信号量请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AcquireSemaphoreRequest {
    #[schema(example = "workers")]
    pub name: String,
    #[schema(example = 5)]
    pub limit: u64,
    #[schema(example = 10000)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub mode: SemaphoreMode,
}

/// 释放或刷新信号量请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct SemaphoreTokenRequest {
    #[schema(example = "workers")]
    pub name: String,
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub token: String,
    #[serde(default)]
    pub mode: SemaphoreMode,
}

/// 提交任务请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ScheduleTaskRequest {
    #[schema(example = "email")]
    pub queue: String,
    #[schema(example = "send_sold_email")]
    pub handler: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub args: serde_json::Value,
    #[serde(default)]
    #[schema(example = 0)]
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ScheduleTaskResponse {
    pub task_id: String,
}

/// 消费任务请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ConsumeTaskRequest {
    #[schema(example = "email")]
    pub queue: String,
    #[schema(example = 1000)]
    pub block_timeout_ms: u64,
}

/// 统一响应结构
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
    pub success: bool,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
            success: true,
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
            success: false,
        }
    }
}
