// Pipeline processing: normalization, deduplication, key resolution

pub mod calendar;
pub mod dedupe;
pub mod keys;
pub mod normalize;
pub mod resolve;
