//! roost-dev - a local-developer reverse proxy with on-demand processes
//!
//! This library provides a development proxy that:
//! - Routes `*.<tld>` hostnames (default `.test`) to user-defined apps
//! - Spawns app processes on demand when the first request arrives
//! - Serves a live interstitial page while an app starts, with captured
//!   logs and a restart button when it fails
//! - Relays WebSocket upgrades byte-for-byte to the backend
//! - Hot-reloads the app config directory without dropping in-flight
//!   requests
//! - Streams status changes to dashboard clients over SSE

pub mod api;
pub mod apps;
pub mod broadcast;
pub mod config;
pub mod logring;
pub mod ollama;
pub mod pages;
pub mod process;
pub mod proxy;
pub mod server;
pub mod watcher;
