use bytes::{Buf, BufMut, Bytes};

use crate::error::MoosError;


/// Everything on the MOOS wire is fixed width little endian. The checked getters turn a
///  short buffer into [MoosError::MalformedPacket] instead of a panic inside `bytes`.
macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(MoosError::MalformedPacket(format!(
                    "buffer underflow reading {}: {} bytes remaining",
                    stringify!($ty),
                    self.remaining()
                )).into());
            }
            Ok(self.$getter())
        }
    }
}


pub trait BufExt: Buf {
    get_checked_impl!(get_checked_u8, u8, get_u8);
    get_checked_impl!(get_checked_i32, i32, get_i32_le);
    get_checked_impl!(get_checked_f64, f64, get_f64_le);

    /// length prefixed (i32) byte sequence
    fn get_checked_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.get_checked_i32()?;
        if len < 0 {
            return Err(MoosError::MalformedPacket(format!("negative field length {}", len)).into());
        }
        let len = len as usize;
        if self.remaining() < len {
            return Err(MoosError::MalformedPacket(format!(
                "field of {} bytes exceeds remaining {} bytes", len, self.remaining()
            )).into());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn get_checked_string(&mut self) -> anyhow::Result<String> {
        let raw = self.get_checked_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| MoosError::MalformedPacket(format!("string field is not UTF-8: {}", e)).into())
    }
}

pub trait BufMutExt: BufMut {
    fn put_prefixed_bytes(&mut self, s: &[u8]) {
        self.put_i32_le(s.len() as i32);
        self.put_slice(s);
    }

    fn put_prefixed_string(&mut self, s: &str) {
        self.put_prefixed_bytes(s.as_bytes());
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
