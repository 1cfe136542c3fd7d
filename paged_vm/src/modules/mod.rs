pub mod block_device;
pub mod victim_selection;
