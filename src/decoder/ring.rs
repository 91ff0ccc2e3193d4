// Decoded frame ring
// Fixed set of frame slots reused round-robin, no per-frame allocation

/// Circular buffer of decode targets.
///
/// `next` is the slot the decoder writes to, `current` the last slot that
/// received a frame. Once a frame has been produced `next == (current + 1) % N`,
/// so a slot is only rewritten after N further frames.
#[derive(Debug)]
pub struct FrameRing<F> {
    slots: Vec<F>,
    current: Option<usize>,
    next: usize,
}

impl<F> FrameRing<F> {
    /// Allocate `count` slots. The first allocation error is returned and
    /// the slots allocated so far are dropped.
    pub fn allocate<E>(
        count: usize,
        mut alloc: impl FnMut() -> Result<F, E>,
    ) -> Result<Self, E> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(alloc()?);
        }
        Ok(Self::from_slots(slots))
    }

    /// Panics if `slots` is empty
    pub fn from_slots(slots: Vec<F>) -> Self {
        assert!(!slots.is_empty(), "frame ring needs at least one slot");
        Self {
            slots,
            current: None,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next frame will be decoded into
    pub fn acquire_next_slot(&mut self) -> (usize, &mut F) {
        let index = self.next;
        (index, &mut self.slots[index])
    }

    /// Mark the `next` slot as holding the newest frame and return it
    pub fn advance(&mut self) -> (usize, &F) {
        let produced = self.next;
        self.current = Some(produced);
        self.next = (produced + 1) % self.slots.len();
        (produced, &self.slots[produced])
    }

    pub fn current(&self) -> Option<(usize, &F)> {
        self.current.map(|index| (index, &self.slots[index]))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn slot(&self, index: usize) -> Option<&F> {
        self.slots.get(index)
    }
}
