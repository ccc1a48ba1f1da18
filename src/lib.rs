//! 3compute workspace backend library
//!
//! Core components for the multi-tenant browser compute environment: the
//! container driver, the terminal session orchestrator and the HTTP surface.

pub mod api;
pub mod auth;
pub mod container;
pub mod files;
pub mod observability;
pub mod terminal;
pub mod webhook;
