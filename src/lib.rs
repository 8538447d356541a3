//! Data hub - append-only channels with webhook delivery to subscription
//! groups.
//!
//! Writers append items to named channels; each subscription group owns a
//! delivery worker that POSTs new items to the group's callback URL in
//! order, retrying with backoff until they are accepted.

pub mod background;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod hub;
pub mod links;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod types;

#[cfg(test)]
pub mod test_utils;
