//! 校验层：同步 gate / 验收测试与异步回溯校验

pub mod gates;
pub mod retrospect;

pub use gates::{CustomPredicate, Verifier};
pub use retrospect::{
    patch_params, CheckRegistry, FnCheck, InvalidationRecord, RetrospectCheck, RetrospectEngine,
    RetrospectVerdict,
};
