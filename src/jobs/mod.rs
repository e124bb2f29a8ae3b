//! Refresh runs

pub mod refresh;

pub use refresh::{
    LibraryReport, RunCoordinator, RunFailure, RunReport, StopReason, collect_warnings,
};
