pub mod noise;
pub mod one_euro;
pub mod selector;

pub use noise::{FilterStats, NoiseFilter};
pub use one_euro::OneEuroFilter;
pub use selector::{Selection, TrackSelector, TrackState};
