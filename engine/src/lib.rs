//! The call engine: per-call lifecycle, provider resolution, recording
//! control and the HTTP surface tying the pieces to the outside world.

pub mod error;
pub mod events;
pub mod provider;
pub mod recording;
pub mod router;
pub mod server;
pub mod session;

pub use error::{EngineError, RecordingError, TransportError};
pub use events::{CallEvent, CallEventKind, EventBus};
pub use router::ResolvedPath;
pub use server::Engine;
pub use session::{CallControlEvent, CallState, SessionManager};
