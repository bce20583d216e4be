pub mod chromatogram;
pub mod params;
pub mod peak;
pub mod session;
pub mod store;
pub mod traits;
pub mod valley;

pub mod isotope;
pub mod locator;
pub mod union;
pub mod api;

#[cfg(test)]
mod test_data;

pub use api::{
    detect_isotopic_peaks, recalculate_within_hard_limits, AnalyteTarget, IsotopeDetector,
    IsotopicPeakSet,
};
pub use chromatogram::{Chromatogram, MeanSmoother, MzProfile, SignalPoint, Smoother};
pub use params::{DetectionParams, SearchMode};
pub use peak::{AreaStatus, Ellipse, OverlapFlags, Peak, Peak3D, PeakTolerance, Probe};
pub use store::ScanStore;
pub use traits::{ChromatogramSource, DetectionError, QuantificationError, StoreError};
pub use valley::BorderStrategy;
