//! Wordnav kernel library
//!
//! Permission-aware menu resolution and synchronization for the learning
//! platform's navigation. The `wordnav` binary wraps it in a CLI.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod menu;
pub mod metrics;
pub mod permissions;
pub mod push;
pub mod sync;

pub use context::{NavContext, NavContextBuilder};
pub use error::{NavError, NavResult};
