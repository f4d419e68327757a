//! 能力层：注册表、工具执行器与内置工具

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{
    render_catalog, CapabilityDescriptor, CapabilityRegistry, CapabilityRegistryBuilder, Handler,
    InvocationContext, RegistryError, Role, Tool,
};
