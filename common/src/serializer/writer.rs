pub struct Writer<'a> {
    bytes: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(bytes: &'a mut Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: &u64) {
        self.write_bytes(&value.to_be_bytes());
    }

    // Strings longer than 255 bytes are truncated at a char boundary
    pub fn write_string(&mut self, value: &str) {
        let mut end = value.len().min(u8::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u8(end as u8);
        self.write_bytes(&value.as_bytes()[..end]);
    }

    pub fn total_write(&self) -> usize {
        self.bytes.len()
    }
}
