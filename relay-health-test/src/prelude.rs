//! Common [`relay_health_test`](crate) types, traits, and functions.

pub use crate::relays::{relay_url, relay_urls, RAW_RELAY_URL_VECTORS};

pub use color_eyre;
pub use color_eyre::eyre;
pub use eyre::Result;
pub use proptest::prelude::*;
