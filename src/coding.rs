use bytes::{Buf, BufMut};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u16> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_be(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_be(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_be(*self);
    }
}

/// Largest value representable by a QUIC variable-length integer.
pub const VAR_INT_MAX: u64 = (1 << 62) - 1;

pub fn decode_var<B: Buf>(buf: &mut B) -> Result<u64> {
    if buf.remaining() < 1 {
        return Err(UnexpectedEnd);
    }
    let first = buf.get_u8();
    let tag = first >> 6;
    let mut x = u64::from(first & 0x3f);
    let extra = (1usize << tag) - 1;
    if buf.remaining() < extra {
        return Err(UnexpectedEnd);
    }
    for _ in 0..extra {
        x = (x << 8) | u64::from(buf.get_u8());
    }
    Ok(x)
}

pub fn encode_var<B: BufMut>(x: u64, buf: &mut B) {
    debug_assert!(x <= VAR_INT_MAX);
    if x < 1 << 6 {
        buf.put_u8(x as u8);
    } else if x < 1 << 14 {
        buf.put_u16_be(0x4000 | x as u16);
    } else if x < 1 << 30 {
        buf.put_u32_be(0x8000_0000 | x as u32);
    } else {
        buf.put_u64_be(0xc000_0000_0000_0000 | x);
    }
}

/// Number of bytes `encode_var` will emit for `x`.
pub fn var_len(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn get_var(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }
    fn get_var(&mut self) -> Result<u64> {
        decode_var(self)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_var(&mut self, x: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }
    fn write_var(&mut self, x: u64) {
        encode_var(x, self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(x: u64) -> u64 {
        let mut buf = Vec::new();
        encode_var(x, &mut buf);
        assert_eq!(buf.len(), var_len(x));
        decode_var(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn var_int_boundaries() {
        for &x in &[
            0,
            63,
            64,
            (1 << 14) - 1,
            1 << 14,
            (1 << 30) - 1,
            1 << 30,
            VAR_INT_MAX,
        ] {
            assert_eq!(roundtrip(x), x);
        }
    }

    #[test]
    fn var_int_rfc_vectors() {
        // Examples from RFC 9000 appendix A.1
        let vectors: &[(&[u8], u64)] = &[
            (&[0x25], 37),
            (&[0x40, 0x25], 37),
            (&[0x7b, 0xbd], 15293),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
            (
                &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
                151_288_809_941_952_652,
            ),
        ];
        for &(bytes, value) in vectors {
            assert_eq!(decode_var(&mut Cursor::new(bytes)).unwrap(), value);
        }
    }

    #[test]
    fn var_int_truncated() {
        assert_eq!(decode_var(&mut Cursor::new([0x40])), Err(UnexpectedEnd));
        assert_eq!(
            decode_var(&mut Cursor::new([0xc0, 0x00, 0x00])),
            Err(UnexpectedEnd)
        );
    }
}
