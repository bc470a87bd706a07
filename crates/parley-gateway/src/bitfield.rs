/// Which chunks of an upload have arrived, one bit per chunk index.
#[derive(Debug, Clone)]
pub struct ChunkBitfield {
    bits: Vec<u64>,
    chunk_count: u32,
    received_count: u32,
}

impl ChunkBitfield {
    pub fn new(chunk_count: u32) -> Self {
        let words = (chunk_count as usize).div_ceil(64);
        Self {
            bits: vec![0u64; words],
            chunk_count,
            received_count: 0,
        }
    }

    /// Mark a chunk as received. Returns true if it was newly received (not a resend).
    #[inline]
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.chunk_count {
            return false;
        }
        let (word, mask) = Self::locate(index);
        if self.bits[word] & mask != 0 {
            return false; // resend
        }
        self.bits[word] |= mask;
        self.received_count += 1;
        true
    }

    #[inline]
    pub fn get(&self, index: u32) -> bool {
        if index >= self.chunk_count {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.bits[word] & mask != 0
    }

    #[inline]
    fn locate(index: u32) -> (usize, u64) {
        let idx = index as usize;
        (idx / 64, 1u64 << (idx % 64))
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.chunk_count
    }

    #[inline]
    pub fn received(&self) -> u32 {
        self.received_count
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.chunk_count
    }

    /// Indices of every chunk not yet received.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.chunk_count).filter(|&i| !self.get(i)).collect()
    }
}
