//! Tessera Overlay
//!
//! Node-facing state the repair pipeline consults:
//! - [`ReputationTracker`]: audit scores, disqualification and suspension
//! - [`OverlayService`]: node registry and replacement selection
//! - [`OrderService`]: ed25519-signed order limits for piece transfers

pub mod orders;
pub mod overlay;
pub mod reputation;

pub use orders::{
    MemoryOrderLedger, OrderConfig, OrderError, OrderLimit, OrderRecorder, OrderService,
    PieceAction,
};
pub use overlay::{NodeDossier, NodeInfo, OverlayConfig, OverlayError, OverlayService};
pub use reputation::{
    AuditHistory, AuditHistoryConfig, AuditOutcome, AuditWindow, NodeReputation,
    ReputationConfig, ReputationError, ReputationTracker,
};
