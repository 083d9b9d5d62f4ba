pub mod api;
pub mod flows;
pub mod orchestrator;

pub use flows::{FlowExecutor, HttpFlowExecutor};
pub use orchestrator::{
    ExecuteRequest, ExecuteResponse, ExecutionMode, ExecutionOrchestrator, FlowSummary,
    PricingStatusResponse,
};
