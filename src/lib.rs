//! Plex metadata refresher
//!
//! Finds catalogue items with missing or broken metadata, repairs them through the media
//! server and a metadata provider, and backs off items that keep failing.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod media;
pub mod services;
