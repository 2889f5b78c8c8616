//! regmux server wiring: the application builder and the HTTP surface.
//!
//! The binary in `main.rs` is a thin shell: parse arguments, initialize
//! tracing, load configuration, hand everything to [`builder::AppBuilder`],
//! and run the resulting [`builder::App`] until a shutdown signal.

/// Application assembly: config → storage → state → sync → HTTP.
pub mod builder;

/// The versioned read/publish HTTP API.
pub mod http;
