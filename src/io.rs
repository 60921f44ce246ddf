use std::mem::size_of;

use bytes::{Buf, BufMut};

use crate::{
    error::DomError,
    types::DomResult,
};

/// Writes itself into a `SmallWriter`.
pub trait Encodeable {
    fn encode(&self, writer: &mut SmallWriter);
}

/// Reads itself back out of a `SmallReader`.
pub trait Decodeable: Sized {
    fn decode(reader: &mut SmallReader<'_>) -> DomResult<Self>;
}

/// Append-only buffer used to assemble page images. All integers are written
/// big-endian so the on-disk byte order is fixed across platforms.
pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Consume the writer, padding the buffer with zeros up to `size`.
    pub fn into_padded_bytes(self, size: usize) -> DomResult<Vec<u8>> {
        let mut buf = self.buf;
        if buf.len() > size {
            return Err(DomError::corruption(&format!(
                "page image overflows its frame: {} > {}",
                buf.len(),
                size
            )));
        }
        buf.resize(size, 0);
        Ok(buf)
    }
}

/// Cursor over a borrowed byte slice. Underruns surface as `Corruption`
/// instead of panicking, since the bytes come straight off the disk.
pub struct SmallReader<'a> {
    buf: &'a [u8],
}

impl<'a> SmallReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, count: usize) -> DomResult<()> {
        if self.buf.remaining() < count {
            return Err(DomError::corruption(&format!(
                "unexpected end of page, need {} bytes, {} left",
                count,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read<T: Decodeable>(&mut self) -> DomResult<T> {
        T::decode(self)
    }

    pub fn read_bytes(&mut self, count: usize) -> DomResult<&'a [u8]> {
        self.need(count)?;
        let (head, tail) = self.buf.split_at(count);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, count: usize) -> DomResult<()> {
        self.need(count)?;
        self.buf.advance(count);
        Ok(())
    }
}

macro_rules! impl_codec {
    (for $($t:ty => $put:ident, $get:ident);+ $(;)?) => {
        $(
            impl Encodeable for $t {
                fn encode(&self, writer: &mut SmallWriter) {
                    writer.buf.$put(*self);
                }
            }

            impl Decodeable for $t {
                fn decode(reader: &mut SmallReader<'_>) -> DomResult<Self> {
                    reader.need(size_of::<Self>())?;
                    Ok(reader.buf.$get())
                }
            }
        )*
    }
}

// bytes' unqualified put/get accessors are big-endian
impl_codec!(for
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
    i16 => put_i16, get_i16;
    i32 => put_i32, get_i32;
    i64 => put_i64, get_i64;
);
