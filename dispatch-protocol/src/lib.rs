//! Wire and domain types shared by every Session Core crate.
//!
//! Nothing in this crate performs I/O; it only defines the shapes that cross
//! component boundaries so that `dispatch-store`, `dispatch-adapters`,
//! `dispatch-hub`, `dispatch-recorder`, `dispatch-orchestrator` and
//! `dispatch-daemon` agree on them without depending on each other.

mod error;
pub mod event;
mod run;
mod wire;
mod workspace;

pub use error::DispatchError;
pub use event::Event;
pub use run::Run;
pub use run::RunKind;
pub use run::RunStatus;
pub use wire::ClientMessage;
pub use wire::CreateSessionRequest;
pub use wire::LayoutAction;
pub use wire::LayoutActionKind;
pub use wire::MAX_FRAME_BYTES;
pub use wire::ServerMessage;
pub use wire::SessionSummary;
pub use workspace::Workspace;
pub use workspace::WorkspacePatch;

/// Milliseconds since the Unix epoch, matching the timestamp representation
/// used throughout the persistence schema (`spec.md` §6.3).
pub type Millis = i64;

pub fn now_millis() -> Millis {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000
}
