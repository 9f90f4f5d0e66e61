/// One-chunk arena with a read cursor.
///
/// `data` is allocated once at `chunk_size + TAG_SIZE` and reused for every
/// chunk: its length is the logical length of the current chunk and `start`
/// is the offset of the next unread byte.
#[derive(Debug)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    start: usize,
}

impl ChunkBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    /// Drop the current chunk, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Prepare to receive `len` raw bytes and return them for filling.
    pub fn load(&mut self, len: usize) -> &mut Vec<u8> {
        self.data.clear();
        self.data.resize(len, 0);
        self.start = 0;
        &mut self.data
    }

    /// Bytes of the current chunk not yet handed out.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn is_drained(&self) -> bool {
        self.start >= self.data.len()
    }

    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
    }

    /// Reposition the cursor inside the current chunk.
    pub fn skip_to(&mut self, offset: usize) {
        self.start = offset.min(self.data.len());
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}
