//! Little-endian POD codec for the capture wire format.
//!
//! Messages are fixed-size with no length prefix, so both sides agree on
//! layout byte for byte; the writer/reader pair below is the single place
//! where that layout is spelled out.

/// Appends little-endian fields to a growable byte buffer.
#[derive(Default)]
pub struct BinaryWriter {
    pub buffer: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes `s` into a fixed-width null-padded field, truncating if
    /// necessary.
    pub fn write_fixed_str(&mut self, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        self.buffer.extend_from_slice(&bytes[..n]);
        self.buffer.extend(std::iter::repeat(0u8).take(width - n));
    }
}

/// Consumes little-endian fields from a byte slice.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        self.take(n)
    }

    /// Reads a fixed-width null-padded string field.
    pub fn read_fixed_str(&mut self, width: usize) -> Option<String> {
        let bytes = self.take(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(width);
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ints() {
        let mut w = BinaryWriter::new();
        w.write_u32(0xdeadbeef);
        w.write_u64(0x0123_4567_89ab_cdef);
        let mut r = BinaryReader::new(&w.buffer);
        assert_eq!(r.read_u32(), Some(0xdeadbeef));
        assert_eq!(r.read_u64(), Some(0x0123_4567_89ab_cdef));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn fixed_str_null_pads_and_truncates() {
        let mut w = BinaryWriter::new();
        w.write_fixed_str("vkcube", 8);
        assert_eq!(w.buffer.len(), 8);
        assert_eq!(&w.buffer[..6], b"vkcube");
        assert_eq!(&w.buffer[6..], &[0, 0]);

        let mut w = BinaryWriter::new();
        w.write_fixed_str("a-very-long-process-name", 8);
        assert_eq!(w.buffer.len(), 8);

        let mut r = BinaryReader::new(&w.buffer);
        assert_eq!(r.read_fixed_str(8).unwrap(), "a-very-l");
    }

    #[test]
    fn short_reads_return_none_without_advancing_past_end() {
        let data = [1u8, 0, 0];
        let mut r = BinaryReader::new(&data);
        assert_eq!(r.read_u32(), None);
        assert_eq!(r.remaining(), 3);
    }

    #[test]
    fn integers_are_little_endian_on_the_wire() {
        let mut w = BinaryWriter::new();
        w.write_u32(1);
        assert_eq!(w.buffer, vec![1, 0, 0, 0]);
    }
}
