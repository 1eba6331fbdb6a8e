//! Pledge reconciliation engine.
//!
//! Keeps a live, cross-checked view of which crowdfunding pledges are still
//! open, which were claimed by the project owner and which were revoked,
//! by asking several independent UTXO sources and accepting an answer only
//! when they agree.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod esplora;
pub mod feed;
pub mod scheduler;
pub mod source;
pub mod surface;
pub mod tracker;
pub mod types;
pub mod verifier;
pub mod view;
pub mod wallet;
pub mod watcher;

#[cfg(test)]
mod test_scenarios;
#[cfg(test)]
mod test_scheduler;
#[cfg(test)]
mod testutil;
