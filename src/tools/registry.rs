//! 能力注册表
//!
//! Agent 与 Tool 共用一个命名空间：名称全局唯一，重名是配置错误。
//! 注册只发生在启动阶段的 CapabilityRegistryBuilder 上；build() 之后的 CapabilityRegistry
//! 只读、可被所有任务共享，Dispatcher 对它的查找无需加锁。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task_scheduler::TaskId;
use crate::protocol::DirectiveKind;
use crate::react::ReasoningStep;

/// 能力角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Tool,
}

impl Role {
    /// 指令类型对应的角色：delegate_to -> Agent，tool_call -> Tool
    pub fn for_kind(kind: DirectiveKind) -> Self {
        match kind {
            DirectiveKind::Delegation => Role::Agent,
            DirectiveKind::ToolCall => Role::Tool,
        }
    }

    pub fn accepts(self, kind: DirectiveKind) -> bool {
        self == Role::for_kind(kind)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Agent => f.write_str("agent"),
            Role::Tool => f.write_str("tool"),
        }
    }
}

/// 工具调用时可见的任务信息
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub depth: usize,
    pub target: String,
}

/// 叶子工具：一次调用、一个结果，不会再产生指令
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 `<tool_call: NAME>`）
    fn name(&self) -> &str;

    /// 工具描述（供推理步骤理解功能）
    fn description(&self) -> &str;

    async fn invoke(&self, payload: &str, ctx: &InvocationContext) -> Result<String, String>;
}

/// 能力处理器
#[derive(Clone)]
pub enum Handler {
    /// Agent：拥有自己的推理步骤，作为嵌套的调度循环运行
    Agent(Arc<dyn ReasoningStep>),
    Tool(Arc<dyn Tool>),
}

impl Handler {
    pub fn role(&self) -> Role {
        match self {
            Handler::Agent(_) => Role::Agent,
            Handler::Tool(_) => Role::Tool,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Agent(_) => f.write_str("Handler::Agent"),
            Handler::Tool(t) => write!(f, "Handler::Tool({})", t.name()),
        }
    }
}

/// 能力描述：名称、角色、描述、处理器
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub role: Role,
    pub description: String,
    pub handler: Handler,
}

/// 注册与解析错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("capability '{name}' declared as {declared} but its handler has role {actual}")]
    RoleMismatch {
        name: String,
        declared: Role,
        actual: Role,
    },
}

/// 渲染能力目录（`- name (role): description`），供 Planner 的 system prompt 使用；
/// `exclude` 用于在 Agent 自己的目录中去掉自身
pub fn render_catalog<'a>(
    entries: impl IntoIterator<Item = (&'a str, Role, &'a str)>,
    exclude: Option<&str>,
) -> String {
    entries
        .into_iter()
        .filter(|(name, _, _)| Some(*name) != exclude)
        .map(|(name, role, description)| format!("- {name} ({role}): {description}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 启动期注册器
#[derive(Debug, Default)]
pub struct CapabilityRegistryBuilder {
    entries: HashMap<String, CapabilityDescriptor>,
    /// 注册顺序，保证目录输出稳定
    order: Vec<String>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        role: Role,
        description: impl Into<String>,
        handler: Handler,
    ) -> Result<&mut Self, RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability(name));
        }
        if handler.role() != role {
            return Err(RegistryError::RoleMismatch {
                name,
                declared: role,
                actual: handler.role(),
            });
        }
        self.order.push(name.clone());
        self.entries.insert(
            name.clone(),
            CapabilityDescriptor {
                name,
                role,
                description: description.into(),
                handler,
            },
        );
        Ok(self)
    }

    pub fn register_tool(&mut self, tool: impl Tool + 'static) -> Result<&mut Self, RegistryError> {
        let name = tool.name().to_string();
        let description = tool.description().to_string();
        self.register(name, Role::Tool, description, Handler::Tool(Arc::new(tool)))
    }

    pub fn register_agent(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        step: Arc<dyn ReasoningStep>,
    ) -> Result<&mut Self, RegistryError> {
        self.register(name, Role::Agent, description, Handler::Agent(step))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn build(self) -> CapabilityRegistry {
        let mut entries = self.entries;
        let descriptors = self
            .order
            .into_iter()
            .filter_map(|name| entries.remove(&name).map(|d| (name, Arc::new(d))))
            .collect::<Vec<_>>();
        CapabilityRegistry {
            order: descriptors.iter().map(|(n, _)| n.clone()).collect(),
            entries: descriptors.into_iter().collect(),
        }
    }
}

/// 只读能力注册表
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Arc<CapabilityDescriptor>>,
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<CapabilityDescriptor>, RegistryError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    /// 按注册顺序返回名称
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
