mod client;
#[cfg(test)]
pub(crate) mod fake;
mod traits;

pub use client::MonzoClient;
pub use traits::{FeedItem, MonzoApi, MonzoError, TokenSet, TransactionInfo};
