pub mod codec;
pub mod connection;
pub mod correlator;
pub mod events;
pub mod persistence;
pub mod ranking;
pub mod snapshot;
pub mod subscriptions;
pub mod transport;
pub mod trending;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
