use chrono::{DateTime, Utc};
use rand::Rng;

const PREFIX_LEN: usize = 3;

/// Produces a human-readable order id: three random uppercase letters plus
/// a minute-granularity timestamp, e.g. `KQT-202403100800`.
///
/// Uniqueness is probabilistic; two orders in the same minute can collide
/// on the prefix. The order writer retries with a fresh id when the insert
/// hits the primary-key constraint.
pub fn generate(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let prefix: String = (0..PREFIX_LEN)
        .map(|_| rng.gen_range(b'A'..=b'Z') as char)
        .collect();
    format!("{}-{}", prefix, now.format("%Y%m%d%H%M"))
}
