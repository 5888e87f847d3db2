//! Tessera Maintenance
//!
//! Background durability work over the metabase and the node fleet:
//! - [`RepairQueue`]: segments waiting for repair, worst health first
//! - [`SegmentRepairer`]: download, reconstruct, re-upload and commit one segment
//! - [`RepairService`]: bounded worker pool draining the queue
//! - [`MaintenanceConfig`]: layered TOML / environment / CLI configuration
//!
//! Metadata garbage collection lives in `tessera_metabase::gc`; the
//! `tessera-maintenance` binary runs it.

pub mod config;
pub mod dialer;
pub mod metrics;
pub mod overrides;
pub mod queue;
pub mod segment;
pub mod service;

pub use config::{
    ConfigError, IdentityConfig, LoggingConfig, MaintenanceConfig, MetricsConfig, RepairConfig,
};
pub use dialer::{DialError, PieceDialer};
pub use overrides::{RedundancyOverride, RepairOverrides};
pub use queue::{MemoryRepairQueue, PostgresRepairQueue, QueueError, RepairJob, RepairQueue};
pub use segment::{RepairError, RepairOutcome, SegmentRepairer};
pub use service::{
    IrreparableSegment, IrreparableSink, LoggingIrreparableSink, MemoryIrreparableSink,
    RepairService, RepairStats,
};
