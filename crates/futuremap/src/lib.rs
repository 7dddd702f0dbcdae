//! A keyed registry of asynchronous results, for correlating replies that
//! arrive out of band with outstanding requests identified by a key.
//!
//! The model works like this:
//! - A caller obtains a future for a key with [`FutureRegistry::get`]. If the
//!   key is unknown this creates a pending placeholder; the returned
//!   [`SettlementFuture`] is clonable and every clone observes the same
//!   eventual [`Outcome`].
//! - Whoever receives the reply settles the key with
//!   [`FutureRegistry::resolve`] (plain value),
//!   [`FutureRegistry::resolve_with`] (adopt another future's outcome) or
//!   [`FutureRegistry::reject`] (failure). Settling a key that was not an
//!   awaitable placeholder fails with [`AlreadySettledError`].
//! - Settled entries linger so their state can still be inspected via
//!   [`FutureRegistry::is_fulfilled`] and friends, and are evicted
//!   automatically once the configured [`Config::eviction_timeout`] elapses.
//!
//! The registry itself never blocks: settlement work runs on spawned tasks,
//! and callers that need the final outcome await the future they hold.

mod config;
mod registry;
mod settlement;

pub use config::Config;
pub use registry::FutureRegistry;
pub use settlement::{AlreadySettledError, Outcome, Rejection, SettlementFuture};
