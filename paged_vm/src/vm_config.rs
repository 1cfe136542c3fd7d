use crate::{
    layout::{MAX_FRAMES, PAGE_SIZE},
    util::ceil_div,
    vm_error::ConfigError,
};

/// bytes of bookkeeping per frame table entry
const FRAME_TABLE_ENTRY_BYTES: usize = 8;
/// bytes of origin cluster bookkeeping per user frame
const ORIGIN_ENTRY_BYTES: usize = 2;
const VACANCY_WORD_BYTES: usize = 4;
const CLUSTERS_PER_VACANCY_WORD: usize = 32;

/// Usable kernel frames needed besides the reserved ones: one master table
/// plus one page table.
const MIN_USABLE_KERNEL_FRAMES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMConfig {
    /// frames that hold user pages
    pub user_frames: usize,

    /// frames that hold page tables, including the reserved bookkeeping frames
    pub kernel_frames: usize,

    /// seeds the random victim selection of both pools
    pub victim_seed: u64,
}

impl Default for VMConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            kernel_frames: 64,
            victim_seed: 0x5EED,
        }
    }
}

impl VMConfig {
    /// Kernel frames that hold the frame tables, the vacancy table of
    /// `clusters` swap clusters and the origin clusters of user frames.
    pub fn reserved_kernel_frames(&self, clusters: usize) -> usize {
        let frame_tables = ceil_div(self.user_frames * FRAME_TABLE_ENTRY_BYTES, PAGE_SIZE)
            + ceil_div(self.kernel_frames * FRAME_TABLE_ENTRY_BYTES, PAGE_SIZE);
        let vacancy_table = ceil_div(
            ceil_div(clusters, CLUSTERS_PER_VACANCY_WORD) * VACANCY_WORD_BYTES,
            PAGE_SIZE,
        );
        let origins = ceil_div(self.user_frames * ORIGIN_ENTRY_BYTES, PAGE_SIZE);

        frame_tables + vacancy_table + origins
    }

    /// Smallest kernel pool that works with this user pool and swap size.
    pub fn min_kernel_frames(&self, clusters: usize) -> usize {
        self.reserved_kernel_frames(clusters) + MIN_USABLE_KERNEL_FRAMES
    }

    /// Checks the configuration and returns the number of reserved kernel frames.
    pub(crate) fn validate(&self, clusters: usize) -> Result<usize, ConfigError> {
        if self.user_frames == 0 {
            return Err(ConfigError::EmptyUserPool);
        }
        for frames in [self.user_frames, self.kernel_frames] {
            if frames > MAX_FRAMES {
                return Err(ConfigError::TooManyFrames(frames));
            }
        }
        if clusters == 0 {
            return Err(ConfigError::NoSwapClusters);
        }

        let required = self.min_kernel_frames(clusters);
        if self.kernel_frames < required {
            return Err(ConfigError::KernelPoolTooSmall {
                required,
                available: self.kernel_frames,
            });
        }
        Ok(self.reserved_kernel_frames(clusters))
    }
}
