//! # fbhub-daemon: Framebuffer Distribution Daemon
//!
//! Hosts one main-screen framebuffer service on a Unix domain socket.
//! Render servers connect to the socket and speak the framed message
//! protocol from `fbhub-core`; an optional built-in client logs every
//! frame notification.
//!
//! Runs in the foreground until Ctrl-C, which invalidates the service,
//! or until the port is cancelled.

pub mod config;
pub mod service;
