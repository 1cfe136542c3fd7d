mod random;

pub use random::RandomVictimSelectionModule;

use core::ops::Range;

/// Picks the frame ordinal at which the search for an eviction victim starts.
///
/// The pool turns the draw into an actual victim: it skips pinned and unused
/// frames and redirects master tables to one of their page tables, so the
/// module does not need to know anything about the frames.
pub trait VictimSelectionModule: Send {
    /// Returns an ordinal inside of `usable`, which is never empty.
    fn draw(&mut self, usable: Range<usize>) -> usize;
}

/// Always starts the search at the same ordinal, clamped into the usable range.
pub struct FixedVictimSelectionModule {
    start: usize,
}

impl FixedVictimSelectionModule {
    pub fn new(start: usize) -> Self {
        Self { start }
    }
}

impl VictimSelectionModule for FixedVictimSelectionModule {
    fn draw(&mut self, usable: Range<usize>) -> usize {
        self.start.clamp(usable.start, usable.end - 1)
    }
}
