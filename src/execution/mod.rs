// Signal execution and order lifecycle
pub mod executor;
pub mod order_manager;

pub use executor::{
    AutoDeny, Confirmation, ExecutionAction, ExecutionDecision, ExecutionReport, Executor,
};
pub use order_manager::{CancelVerification, LifecycleReport, OrderLifecycleManager, StateSnapshot};
