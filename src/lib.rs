//! Control plane for sandboxed agent sessions.
//!
//! One [`hub::SessionHub`] supervises each session's sandbox, routes agent tool
//! calls (intercepting the privileged ones), wraps snapshots in an env-file
//! scrub/re-apply cycle, and works alongside the versioned billing tokens
//! that meter the session.

#![deny(missing_docs)]

/// Billing token service and refresh route
pub mod billing;
/// Settings and constants
pub mod config;
/// Session hub, actor loop and registry
pub mod hub;
/// Sandbox provider seam and Docker backend
pub mod sandbox;
/// HTTP and WebSocket surface
pub mod server;
/// Session model and persistence seam
pub mod session;
/// Snapshot lifecycle: env catalog, scrub/re-apply guard, logging contract
pub mod snapshot;
/// Intercepted tool registry
pub mod tools;
/// Log redaction and string helpers
pub mod utils;
