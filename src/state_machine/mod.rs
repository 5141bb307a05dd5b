// Execution lifecycle state machine.
//
// The status enum and transition table live here so that the ledger is the only place
// that can apply them, and so they can be unit tested without a database.

pub mod events;
pub mod states;
pub mod transitions;

pub use events::ExecutionEventType;
pub use states::ExecutionStatus;
pub use transitions::{is_allowed, target_event, ExecutionTransition};
