//! Hibergate - a Minecraft-aware reverse proxy for hibernating servers
//!
//! This library provides a TCP reverse proxy that:
//! - Routes Minecraft connections by the handshake's server address to one
//!   of several configured backends
//! - Starts a stopped backend's cloud instance when a player tries to log in
//! - Synthesizes believable server-list status responses while a backend is
//!   stopped or starting
//! - Replays the captured handshake and login packets to the backend, then
//!   relays raw bytes in both directions
//! - Stops backends again after a configurable idle period
//! - Supports Compute Engine instances and Docker containers as backends

pub mod backend;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod minecraft;
pub mod protocol;
pub mod proxy;
