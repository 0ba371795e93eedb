//! Session orchestration for one classroom client
//!
//! The [`ReconciliationController`] joins a session, keeps one PeerLink per
//! present participant and mirrors the replicated classroom state kept by
//! [`SessionStateStore`].

pub mod collaborators;
pub mod commands;
pub mod controller;
pub mod state;

pub use collaborators::{
    Credentials, DeviceMediaSource, MediaSource, MemoryPersistence, PersistenceLayer,
    SessionRecord,
};
pub use commands::ControllerCommand;
pub use controller::{Collaborators, ControllerConfig, ExitReason, ReconciliationController};
pub use state::SessionStateStore;
