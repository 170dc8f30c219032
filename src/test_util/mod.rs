//! In-memory stand-ins for the transport and filesystem collaborators. They are used
//!  for testing this crate itself, but they are also exported for application testing,
//!  which is why they are part of the regular (non-#[cfg(test)]) code.

pub mod fs;
pub mod transport;
