//! 工具执行器
//!
//! 对每次工具调用：先从 TaskScheduler 取并发许可，再在超时内调用工具；
//! 超时或失败时转为 DirectiveError（Timeout / HandlerFailed）；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{DirectiveError, TaskScheduler};
use crate::tools::{InvocationContext, Tool};

/// payload 预览最大字符数
const PAYLOAD_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时与并发限制，并将结果映射为 DirectiveError
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    scheduler: TaskScheduler,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(scheduler: TaskScheduler, timeout: Duration) -> Self {
        Self { scheduler, timeout }
    }

    /// 执行工具；输出 JSON 审计日志
    pub async fn invoke(
        &self,
        tool: &dyn Tool,
        payload: &str,
        ctx: &InvocationContext,
    ) -> Result<String, DirectiveError> {
        let _permit = self
            .scheduler
            .acquire_tool()
            .await
            .map_err(|e| DirectiveError::HandlerFailed {
                target: ctx.target.clone(),
                reason: e.to_string(),
            })?;

        let start = Instant::now();
        let result = timeout(self.timeout, tool.invoke(payload, ctx)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": ctx.target,
            "task": ctx.task_id.to_string(),
            "depth": ctx.depth,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "payload_preview": payload_preview(payload),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(reason)) => Err(DirectiveError::HandlerFailed {
                target: ctx.target.clone(),
                reason,
            }),
            Err(_) => Err(DirectiveError::Timeout {
                target: ctx.target.clone(),
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

fn payload_preview(payload: &str) -> String {
    if payload.chars().count() > PAYLOAD_PREVIEW_CHARS {
        format!(
            "{}...",
            payload.chars().take(PAYLOAD_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        payload.to_string()
    }
}
