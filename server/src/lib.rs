//! # Voice Relay Server Library
//!
//! This library implements a proximity voice relay for a multiplayer game
//! server. Game clients authenticate over UDP, stream compressed audio
//! frames, and receive the frames of every nearby player in their world,
//! scaled by per-world priority settings.
//!
//! ## Core Responsibilities
//!
//! ### Session Authentication
//! Every speaker must establish a voice session before any audio is relayed:
//! - AUTH requests are checked against the account's stored voice credential
//! - A live game session is required; a re-auth rebinds the UDP endpoint
//! - Idle sessions are swept after a day without traffic
//!
//! ### Proximity Resolution
//! Listeners are found through a spatial hash grid keyed by cell coordinates,
//! refreshed from the game-state directory on a short TTL so the per-packet
//! cost stays flat regardless of how often a speaker sends.
//!
//! ### Admission and Arbitration
//! Each listener hears at most a fixed number of concurrent speakers, with
//! farther speakers displaced by closer ones. When a world's crowd crosses
//! its configured threshold, per-world priority settings decide each frame's
//! volume multiplier, and silent non-priority frames are dropped outright.
//!
//! ## Architecture Design
//!
//! A single receive loop pulls datagrams off the socket and spawns a task
//! per packet; all shared tables are concurrent maps locked at entry
//! granularity, so frames from different speakers never contend. Downlink
//! sends are fire-and-forget: a lost frame is superseded by the next one.
//!
//! ## Module Organization
//!
//! - [`relay`]: socket loops, packet dispatch, and the fan-out path
//! - [`session`]: authenticated UDP session table
//! - [`spatial`]: spatial hash grid for range queries
//! - [`cache`]: TTL caches over the position and account collaborators
//! - [`slots`]: per-listener speaker-slot admission control
//! - [`priority`]: per-world priority settings and volume arbitration
//! - [`world`]: seams to the game-state directory and synthetic test bots
//! - [`stats`]: relay counters sampled by the periodic stats log

pub mod cache;
pub mod priority;
pub mod relay;
pub mod session;
pub mod slots;
pub mod spatial;
pub mod stats;
pub mod world;
