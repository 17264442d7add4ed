//! The coordination service: the typed client every node talks through,
//! and the resolver itself with its name registry, broker proxy and
//! liveness sweeper.

pub mod broker;
pub mod client;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod resolver;

pub use client::Client;
pub use resolver::Resolver;
