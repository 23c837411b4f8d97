//! Omniroster - live presence and session aggregator for social VR platforms
//!
//! This library crate exposes internal modules for integration testing.

pub mod config;
pub mod data;
pub mod integrations;
pub mod monitor;
pub mod registry;
pub mod util;
