//! Echo 能力（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Capability, CapabilitySpec, Invocation, InvocationRequest};
use crate::core::CapabilityError;

/// Echo 能力：把参数与输入合并后原样返回；幂等、零成本
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> CapabilitySpec {
        CapabilitySpec::new("echo")
            .description("Echo params and resolved inputs back as the output object")
            .idempotent(true)
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation, CapabilityError> {
        if request.cancel.is_cancelled() {
            return Err(CapabilityError::Cancelled);
        }
        let mut output = request.inputs;
        for (k, v) in request.params {
            output.insert(k, v);
        }
        Ok(Invocation::new(Value::Object(output)))
    }
}
