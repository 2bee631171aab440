use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Invalid size")]
    InvalidSize,
    #[error("Invalid value")]
    InvalidValue,
    #[error("Invalid UTF-8 string")]
    InvalidString,
}

/// Cursor over a received byte slice.
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, total: 0 }
    }

    pub fn read_bytes_ref(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.bytes.len() {
            return Err(ReaderError::InvalidSize);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        self.total += n;
        Ok(head)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], ReaderError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes_ref(N)?);
        Ok(out)
    }

    pub fn read_bytes_32(&mut self) -> Result<[u8; 32], ReaderError> {
        self.read_bytes::<32>()
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.read_bytes::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ReaderError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        Ok(u16::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        Ok(u32::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        Ok(u64::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_string(&mut self) -> Result<String, ReaderError> {
        let len = self.read_u8()? as usize;
        self.read_string_with_size(len)
    }

    pub fn read_string_with_size(&mut self, len: usize) -> Result<String, ReaderError> {
        let bytes = self.read_bytes_ref(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ReaderError::InvalidString)
    }

    /// Bytes left to read.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes consumed so far.
    pub fn total_read(&self) -> usize {
        self.total
    }
}
