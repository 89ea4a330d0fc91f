//! Call negotiation: invite, accept, reject, cancel and hangup.

mod call;
mod state;

pub use call::CallSession;
pub use state::{CallState, FailureReason, SessionSnapshot};
