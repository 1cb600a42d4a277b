//! Ports - seams for things the engine should not hard-wire (time, ID generation).

pub mod clock;
pub mod id_generator;

#[cfg(test)]
pub use self::clock::FixedClock;
pub use self::clock::{Clock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
