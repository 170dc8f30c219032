use anyhow::bail;
use bytes::{Buf, BufMut};


/// Checked reads for wire strings. Scalars use the checked `try_get_*` family on
///  [bytes::Buf] directly; strings add a u16 length prefix (network byte order like all
///  other scalars) and a hard per-field maximum that is enforced on both ends.
pub trait BufExt: Buf {
    fn try_get_string(&mut self, max_len: usize) -> anyhow::Result<String> {
        let len = self.try_get_u16()? as usize;
        if len > max_len {
            bail!("string of {} bytes exceeds the field maximum of {}", len, max_len);
        }
        if self.remaining() < len {
            bail!("buffer underflow: string of {} bytes announced, {} remaining", len, self.remaining());
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: BufMut {
    fn put_string(&mut self, s: &str, max_len: usize) -> anyhow::Result<()> {
        if s.len() > max_len {
            bail!("string of {} bytes exceeds the field maximum of {}", s.len(), max_len);
        }
        self.put_u16(s.len() as u16);
        self.put_slice(s.as_bytes());
        Ok(())
    }
}


impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::simple("town01")]
    #[case::umlaut("über")]
    fn test_string_round_trip(#[case] s: &str) {
        let mut buf = BytesMut::new();
        buf.put_string(s, 64).unwrap();
        assert_eq!(buf.len(), 2 + s.len());

        let mut read = &buf[..];
        assert_eq!(read.try_get_string(64).unwrap(), s);
        assert!(read.is_empty());
    }

    #[rstest]
    fn test_put_string_overlong() {
        let mut buf = BytesMut::new();
        assert!(buf.put_string("abcdef", 5).is_err());
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::overlong_length(b"\x00\x06abcdef", 5)]
    #[case::announced_more_than_present(b"\x00\x06abc", 16)]
    #[case::missing_prefix(b"\x01", 16)]
    fn test_get_string_malformed(#[case] raw: &[u8], #[case] max_len: usize) {
        let mut read = raw;
        assert!(read.try_get_string(max_len).is_err());
    }
}
