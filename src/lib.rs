//! Registry tag tracking and safe container auto-update.
//!
//! Polls container registries to detect when a floating tag (e.g. `latest`)
//! points at different content than the version tag observed last cycle,
//! and, when allowed to, pulls the new image and recreates the affected
//! containers with their configuration preserved and rollback on failure.

pub mod config;
pub mod controller;
pub mod engine;
pub mod image_reference;
pub mod oci_registry;
pub mod rollout;
pub mod state;
pub mod webserver;
