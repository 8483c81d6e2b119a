//! ActionHandler registry (spec §4.9): the core's two reference handlers,
//! plus the compiled-in registry the Coordinator is built from.

mod env_verify;
mod orchestration_test;

pub use env_verify::EnvVerifyHandler;
pub use orchestration_test::OrchestrationTestHandler;

use std::sync::Arc;

use crate::coordinator::ActionHandler;

/// The handlers the core ships for self-test (§4.9). Application startup
/// scans this fixed list rather than doing any dynamic plugin discovery —
/// adding an operation type means adding a variant here.
pub fn builtin_handlers() -> Vec<Arc<dyn ActionHandler>> {
    vec![Arc::new(EnvVerifyHandler), Arc::new(OrchestrationTestHandler)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_handlers_cover_both_reference_operation_types() {
        let handlers = builtin_handlers();
        let types: Vec<&str> = handlers.iter().map(|h| h.operation_type()).collect();
        assert!(types.contains(&"EnvVerify"));
        assert!(types.contains(&"OrchestrationTest"));
    }
}
