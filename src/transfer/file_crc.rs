use std::fmt::{Debug, Formatter};

use crc::Crc;


/// Seeded checksum over a file's contents, used to decide whether a namesake on the
///  remote side is identical and the transfer can be skipped. Both ends fold the same
///  wire-carried seed in first, so a stale cached value never matches by accident.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct FileCrc(pub u32);

impl Debug for FileCrc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}

impl FileCrc {
    pub fn new(seed: u32, contents: &[u8]) -> FileCrc {
        let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = hasher.digest();

        digest.update(&seed.to_be_bytes());
        digest.update(contents);

        FileCrc(
            digest.finalize()
        )
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_same_seed_same_contents_match() {
        assert_eq!(FileCrc::new(17, b"abc"), FileCrc::new(17, b"abc"));
    }

    #[rstest]
    #[case::different_contents(17, b"abc".as_slice(), 17, b"abd".as_slice())]
    #[case::different_seed(17, b"abc".as_slice(), 18, b"abc".as_slice())]
    fn test_mismatch(#[case] seed_a: u32, #[case] a: &[u8], #[case] seed_b: u32, #[case] b: &[u8]) {
        assert_ne!(FileCrc::new(seed_a, a), FileCrc::new(seed_b, b));
    }
}
