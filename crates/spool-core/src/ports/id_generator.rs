//! IdGenerator port - ID generation.
//!
//! Abstracted as a trait so the store's collision handling can be tested with a
//! generator that deliberately repeats itself.

use ulid::Ulid;

use crate::domain::ids::JobId;
use crate::ports::Clock;

/// Generates IDs that are unique without coordination.
///
/// # Thread Safety
/// - `Send + Sync` is required (the store shares one generator across tasks)
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;
}

/// ULID-based generator: timestamp from `C`, 80 random bits.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next())
    }
}
