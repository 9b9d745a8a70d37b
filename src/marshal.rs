//! # Marshalling Capabilities
//!
//! The store proper treats keys and values as opaque bytes. Typed access is
//! layered on top through two capability traits: a [`BytesWriter`] that
//! emits the bytes of a value and reports their size, and a [`BytesReader`]
//! that rebuilds a value from bytes, reusing a caller-provided instance
//! when it can.
//!
//! Two stock implementations cover the common cases: [`RawBytes`] for
//! `[u8]`/`Vec<u8>` and [`Utf8`] for `str`/`String`. Applications bring
//! their own for anything richer.

use eyre::Result;

use crate::store::Store;

/// Emits the byte representation of `T`.
pub trait BytesWriter<T: ?Sized> {
    /// Exact number of bytes [`BytesWriter::write`] will produce.
    fn size(&self, value: &T) -> usize;

    /// Writes the value into `out`, which is exactly `size(value)` long.
    fn write(&self, value: &T, out: &mut [u8]);
}

/// Rebuilds a value from its byte representation.
pub trait BytesReader {
    type Out;

    /// Reads a value, reusing `using`'s allocation when possible.
    fn read(&self, bytes: &[u8], using: Option<Self::Out>) -> Self::Out;
}

/// Identity marshalling for raw byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl BytesWriter<[u8]> for RawBytes {
    fn size(&self, value: &[u8]) -> usize {
        value.len()
    }

    fn write(&self, value: &[u8], out: &mut [u8]) {
        out.copy_from_slice(value);
    }
}

impl BytesReader for RawBytes {
    type Out = Vec<u8>;

    fn read(&self, bytes: &[u8], using: Option<Vec<u8>>) -> Vec<u8> {
        match using {
            Some(mut buf) => {
                buf.clear();
                buf.extend_from_slice(bytes);
                buf
            }
            None => bytes.to_vec(),
        }
    }
}

/// UTF-8 string marshalling. Reading replaces invalid sequences rather
/// than failing: stored bytes that were written through [`Utf8`] are always
/// valid, so replacement only triggers on foreign or corrupted data.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl BytesWriter<str> for Utf8 {
    fn size(&self, value: &str) -> usize {
        value.len()
    }

    fn write(&self, value: &str, out: &mut [u8]) {
        out.copy_from_slice(value.as_bytes());
    }
}

impl BytesReader for Utf8 {
    type Out = String;

    fn read(&self, bytes: &[u8], using: Option<String>) -> String {
        match std::str::from_utf8(bytes) {
            Ok(s) => match using {
                Some(mut out) => {
                    out.clear();
                    out.push_str(s);
                    out
                }
                None => s.to_owned(),
            },
            Err(_) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl Store {
    /// Typed put through writer capabilities.
    pub fn put_with<K: ?Sized, V: ?Sized>(
        &self,
        key_writer: &impl BytesWriter<K>,
        key: &K,
        value_writer: &impl BytesWriter<V>,
        value: &V,
    ) -> Result<()> {
        let mut key_buf = vec![0u8; key_writer.size(key)];
        key_writer.write(key, &mut key_buf);
        let mut value_buf = vec![0u8; value_writer.size(value)];
        value_writer.write(value, &mut value_buf);

        self.put(&key_buf, &value_buf)?;
        Ok(())
    }

    /// Typed get through a reader capability; `using` is recycled on a hit.
    pub fn get_with<K: ?Sized, R: BytesReader>(
        &self,
        key_writer: &impl BytesWriter<K>,
        key: &K,
        reader: &R,
        using: Option<R::Out>,
    ) -> Result<Option<R::Out>> {
        let mut key_buf = vec![0u8; key_writer.size(key)];
        key_writer.write(key, &mut key_buf);

        let ctx = self.query(&key_buf)?;
        Ok(ctx.entry()?.map(|e| reader.read(e.value(), using)))
    }
}
