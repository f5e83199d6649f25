//! Chat-platform client for the CardFlow gateway.
//!
//! Covers the outbound surface of the card platform: bearer-token caching,
//! card entity creation, streaming element updates, message sending, and
//! the pre-created card pool that hides card-creation latency from the
//! request path.

pub mod auth;
pub mod cards;
mod client;
mod pool;
mod util;

pub use auth::TokenCache;
pub use client::{CardInfo, CardSurface, PlatformClient, ELEMENT_ID};
pub use pool::{CardCreator, CardPool, POOL_CAPACITY};
