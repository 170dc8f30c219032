use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for service GUID minting and CRC seeds. Neither use is security
///  relevant - the values only need to be reasonably unique within a process.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }
}
