//! Offline cache and background sync for the chit-fund web app.
//!
//! The worker sits between the application shell and the network: it seeds a
//! versioned shell cache at install, serves requests through per-route cache
//! strategies, and queues writes made offline until a sync signal replays them.

pub mod cache;
pub mod config;
pub mod db;
pub mod net;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;
