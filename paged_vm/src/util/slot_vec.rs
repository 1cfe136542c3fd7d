/// Vector of optional slots that reuses freed indices.
///
/// Indices stay stable while occupied, so they double as ids. The most
/// recently freed slot is reused first, which keeps ids dense: with `n`
/// occupied slots no id is larger than the highest count ever reached.
pub(crate) struct SlotVec<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    occupied: usize,
}

impl<T> SlotVec<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            occupied: 0,
        }
    }

    /// Stores the value built from its future index and returns that index.
    pub(crate) fn insert_with(&mut self, f: impl FnOnce(usize) -> T) -> usize {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(f(index));
        self.occupied += 1;
        index
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Frees the slot and hands back its value.
    pub(crate) fn mark_empty(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        self.occupied -= 1;
        Some(value)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }
}

impl<T> core::ops::Index<usize> for SlotVec<T> {
    type Output = T;

    /// Panics if the slot is empty.
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("slot {} is empty", index),
        }
    }
}
