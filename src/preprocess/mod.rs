//! Cloud preprocessing filters.

mod downsampler;

pub use downsampler::VoxelGridFilter;
