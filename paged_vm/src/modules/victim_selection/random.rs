use core::ops::Range;

use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::VictimSelectionModule;

/// Uniformly random victim selection.
pub struct RandomVictimSelectionModule {
    rng: SmallRng,
}

impl RandomVictimSelectionModule {
    /// Same seed, same sequence of draws.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl VictimSelectionModule for RandomVictimSelectionModule {
    fn draw(&mut self, usable: Range<usize>) -> usize {
        self.rng.gen_range(usable)
    }
}
