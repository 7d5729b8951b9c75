//! Interactive code execution service.
//!
//! Clients open a WebSocket session (`/ws?lang=<tag>`), submit source with
//! `CODE:` frames, stream stdin, and receive program output in real time.
//! Execution happens inside pooled, hardened sandboxes managed by the
//! [`pool`] crate; the session driver here compiles (where needed),
//! attaches, and supervises each run.

pub mod compile;
pub mod error;
pub mod serve;
pub mod session;
pub mod status;
pub mod transport;
