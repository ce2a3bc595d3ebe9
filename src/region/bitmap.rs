//! Sector Bitmap
//!
//! Free/used map over the 4 KiB sectors of one region file. Allocation is
//! first-fit from sector 0; nothing is ever moved or compacted. The bitmap
//! is not synchronized itself: its owning [`SectorFile`] mutates it under
//! the allocation table lock.
//!
//! [`SectorFile`]: super::SectorFile

const WORD_BITS: usize = 64;

/// Growable bit set, one bit per sector (1 = used)
#[derive(Debug, Clone, Default)]
pub struct SectorBitmap {
    words: Vec<u64>,
}

impl SectorBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `[start, start + count)` used
    pub fn force(&mut self, start: usize, count: usize) {
        if count == 0 {
            return;
        }
        self.grow_to(start + count);
        for sector in start..start + count {
            self.words[sector / WORD_BITS] |= 1u64 << (sector % WORD_BITS);
        }
    }

    /// Mark `[start, start + count)` free
    pub fn free(&mut self, start: usize, count: usize) {
        let end = (start + count).min(self.words.len() * WORD_BITS);
        for sector in start..end {
            self.words[sector / WORD_BITS] &= !(1u64 << (sector % WORD_BITS));
        }
    }

    /// Claim the first gap of at least `count` sectors and return its start
    ///
    /// The space past the last used sector counts as an infinite gap, so
    /// this always succeeds.
    pub fn allocate(&mut self, count: usize) -> usize {
        let mut cursor = 0;
        loop {
            let begin = self.next_clear(cursor);
            match self.next_set(begin) {
                Some(end) if end - begin < count => cursor = end,
                _ => {
                    self.force(begin, count);
                    return begin;
                }
            }
        }
    }

    pub fn is_used(&self, sector: usize) -> bool {
        self.words
            .get(sector / WORD_BITS)
            .map(|word| word & (1u64 << (sector % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    /// Whether any sector of `[start, start + count)` is used
    pub fn any_used(&self, start: usize, count: usize) -> bool {
        (start..start + count).any(|sector| self.is_used(sector))
    }

    /// Number of used sectors
    pub fn used_count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// One past the highest used sector
    pub fn high_water_mark(&self) -> usize {
        for (i, word) in self.words.iter().enumerate().rev() {
            if *word != 0 {
                return i * WORD_BITS + (WORD_BITS - word.leading_zeros() as usize);
            }
        }
        0
    }

    /// First clear sector at or after `from`
    fn next_clear(&self, from: usize) -> usize {
        let mut index = from / WORD_BITS;
        if index >= self.words.len() {
            return from;
        }
        // Treat bits below `from` as set so they are skipped
        let mut word = !self.words[index] & (!0u64 << (from % WORD_BITS));
        loop {
            if word != 0 {
                return index * WORD_BITS + word.trailing_zeros() as usize;
            }
            index += 1;
            if index >= self.words.len() {
                return index * WORD_BITS;
            }
            word = !self.words[index];
        }
    }

    /// First used sector at or after `from`, if any
    fn next_set(&self, from: usize) -> Option<usize> {
        let mut index = from / WORD_BITS;
        if index >= self.words.len() {
            return None;
        }
        let mut word = self.words[index] & (!0u64 << (from % WORD_BITS));
        loop {
            if word != 0 {
                return Some(index * WORD_BITS + word.trailing_zeros() as usize);
            }
            index += 1;
            if index >= self.words.len() {
                return None;
            }
            word = self.words[index];
        }
    }

    fn grow_to(&mut self, sectors: usize) {
        let needed = sectors.div_ceil(WORD_BITS);
        if needed > self.words.len() {
            self.words.resize(needed, 0);
        }
    }
}
