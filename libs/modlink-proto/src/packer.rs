//! Byte packer
//!
//! Append-only builder producing a fixed-endianness byte sequence from typed
//! scalar writes. Every encoder in the crate goes through it.

/// Byte order used for a single scalar write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Append-only byte builder
#[derive(Debug, Clone, Default)]
pub struct BytePacker {
    buf: Vec<u8>,
}

macro_rules! put_scalar {
    ($name:ident, $ty:ty) => {
        #[inline]
        pub fn $name(self, value: $ty, endian: Endian) -> Self {
            match endian {
                Endian::Big => self.bytes(&value.to_be_bytes()),
                Endian::Little => self.bytes(&value.to_le_bytes()),
            }
        }
    };
}

impl BytePacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    #[inline]
    pub fn i8(self, value: i8) -> Self {
        self.u8(value as u8)
    }

    /// Big-endian u16, the Modbus default for addresses and quantities
    #[inline]
    pub fn word(self, value: u16) -> Self {
        self.u16(value, Endian::Big)
    }

    put_scalar!(u16, u16);
    put_scalar!(i16, i16);
    put_scalar!(u32, u32);
    put_scalar!(i32, i32);
    put_scalar!(u64, u64);
    put_scalar!(i64, i64);
    put_scalar!(f32, f32);
    put_scalar!(f64, f64);

    #[inline]
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Pad with zero bytes up to `len`
    pub fn pad_to(mut self, len: usize) -> Self {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_endianness() {
        let bytes = BytePacker::new()
            .u8(0x03)
            .word(0x0102)
            .u16(0x0102, Endian::Little)
            .u32(0xAABBCCDD, Endian::Big)
            .finish();
        assert_eq!(bytes, vec![0x03, 0x01, 0x02, 0x02, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_float_and_padding() {
        let packer = BytePacker::with_capacity(8).f32(1.0, Endian::Big).pad_to(6);
        assert_eq!(packer.len(), 6);
        assert_eq!(packer.as_slice(), &[0x3F, 0x80, 0x00, 0x00, 0x00, 0x00]);
    }
}
