//! Byte buffer with a cursor, the unit of partial I/O.

/// A byte buffer whose cursor records how much of it has been transferred.
///
/// `write` calls send `data[position..]` and advance the cursor; `read`
/// calls fill `data[position..]`. A buffer is *full* (or *drained*) once the
/// cursor reaches its length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled buffer of `len` bytes, ready to be read into.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            position: 0,
        }
    }

    /// Wraps bytes that are ready to be written.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// True once the cursor reached the end of the buffer.
    pub fn is_full(&self) -> bool {
        self.position == self.data.len()
    }

    pub fn advance(&mut self, count: usize) {
        self.position = (self.position + count).min(self.data.len());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bytes transferred so far.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.position]
    }

    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub fn remaining_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..]
    }

    /// Resizes the buffer, zero-filling new bytes and clamping the cursor.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        self.position = self.position.min(len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
    }

    /// Replaces the content and rewinds the cursor.
    pub fn reset(&mut self, data: Vec<u8>) {
        self.data = data;
        self.position = 0;
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn cursor_is_clamped() {
        let mut buffer = Buffer::from_vec(vec![1, 2, 3]);
        buffer.advance(2);
        assert_eq!(buffer.remaining_slice(), &[3]);
        buffer.advance(10);
        assert!(buffer.is_full());
        buffer.resize(1);
        assert_eq!(buffer.position(), 1);
    }
}
