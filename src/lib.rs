pub mod net;
pub mod session;
pub mod transfer;
pub mod util;
pub mod test_util;
