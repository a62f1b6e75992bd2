use std::sync::atomic::AtomicU8;

use atomic::Ordering;

/// Dirty bytemap over fixed card granules of one segment. Cells are atomic
/// bytes: a mutator on another heap may dirty a card here while the owning
/// thread allocates, so plain stores would race.
pub struct CardTable {
    card_size: usize,
    segment_size: usize,
    cards: Box<[AtomicU8]>,
}

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

impl CardTable {
    pub fn new(segment_size: usize, card_size: usize) -> Self {
        assert!(card_size >= 64, "card granule below 64 bytes");
        let len = segment_size.div_ceil(card_size);
        let cards = (0..len).map(|_| AtomicU8::new(CLEAN)).collect();
        Self {
            card_size,
            segment_size,
            cards,
        }
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    #[inline]
    pub fn mark_dirty_by_offset(&self, offset: usize) {
        self.cards[offset / self.card_size].store(DIRTY, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Acquire) == DIRTY
    }

    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Acquire) == DIRTY)
            .count()
    }

    /// Byte spans `[start, end)` covered by each dirty card, clamped to the
    /// segment size.
    pub fn dirty_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Acquire) == DIRTY {
                let start = i * self.card_size;
                let end = (start + self.card_size).min(self.segment_size);
                ranges.push((start, end));
            }
        }
        ranges
    }

    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CLEAN, Ordering::Release);
        }
    }

    /// Dirties every card; diagnostic marks use it to force a full
    /// old-generation scan.
    pub fn mark_all_dirty(&self) {
        for card in self.cards.iter() {
            card.store(DIRTY, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_partial_trailing_card() {
        let table = CardTable::new(1000, 256);
        assert_eq!(table.card_count(), 4);
        table.mark_dirty_by_offset(999);
        assert_eq!(table.dirty_ranges(), vec![(768, 1000)]);
    }

    #[test]
    fn dirty_and_clear() {
        let table = CardTable::new(4096, 256);
        table.mark_dirty_by_offset(0);
        table.mark_dirty_by_offset(300);
        table.mark_dirty_by_offset(511);
        assert_eq!(table.dirty_count(), 2);
        assert_eq!(table.dirty_ranges(), vec![(0, 256), (256, 512)]);
        table.clear_all();
        assert_eq!(table.dirty_count(), 0);
        assert!(table.dirty_ranges().is_empty());
    }
}
