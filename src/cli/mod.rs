//! Terminal front end for media-relay
//!
//! Holds the console delivery surface used when no bot token is configured.

pub mod console;

pub use console::ConsoleSurface;
