//! State machine module.

pub mod handlers;
pub mod machine;
pub mod recovery;

pub use handlers::{HandlerContext, process_next_command};
pub use machine::{NegotiationState, Phase, SessionState, TransferRequest};
pub use recovery::{drain_stale_input, drain_window};
