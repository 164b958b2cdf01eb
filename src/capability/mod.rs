//! 能力层：agent / tool 的统一抽象与注册表

pub mod echo;
pub mod registry;

pub use echo::EchoCapability;
pub use registry::{Capability, CapabilityRegistry, CapabilitySpec, Invocation, InvocationRequest};
