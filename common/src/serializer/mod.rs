//! Compact binary serialization used on the discovery wire.
//!
//! All integers are big-endian. Strings are written with a one byte length
//! prefix, which bounds them to 255 bytes.

mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

/// Types that can be written to and read back from the wire format.
pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn write(&self, writer: &mut Writer);

    /// Exact number of bytes `write` produces.
    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size());
        let mut writer = Writer::new(&mut buffer);
        self.write(&mut writer);
        buffer
    }

    /// Decode a value, rejecting any trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::InvalidSize);
        }
        Ok(value)
    }
}

impl Serializer for String {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_string()
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_string(self);
    }

    fn size(&self) -> usize {
        1 + self.len().min(u8::MAX as usize)
    }
}

impl<T: Serializer> Serializer for Option<T> {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        if reader.read_bool()? {
            Ok(Some(T::read(reader)?))
        } else {
            Ok(None)
        }
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bool(self.is_some());
        if let Some(value) = self {
            value.write(writer);
        }
    }

    fn size(&self) -> usize {
        1 + self.as_ref().map_or(0, Serializer::size)
    }
}
