//! Call-level control plane
//!
//! The coordinator owns each call's state machine and pre-roll; the session
//! runs the per-call serial event loop; the manager owns the session index
//! and webhook dispatch.

pub mod coordinator;
pub mod manager;
pub mod preroll;
pub mod session;
pub mod state;

pub use coordinator::{AudioCoordinator, TimingSummary};
pub use manager::{CarrierWebhook, SessionManager};
pub use preroll::PreRollRing;
pub use session::{CallEvent, CallSession, SessionContext};
pub use state::CallState;
