/*! Traits and error types that connect the peak locator to a raw data source */
use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::chromatogram::{Chromatogram, MzProfile, SignalPoint};
use crate::peak::AreaStatus;

/// An error raised by a [`ChromatogramSource`] while reading raw signal.
///
/// These are never recovered from during detection and abort processing of
/// the current analyte.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("An IO error occurred while reading raw data: {0}")]
    Io(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("No scans are available at MS level {0}")]
    MsLevelNotAvailable(u8),
    #[error("The requested window {low}-{high} is empty or inverted")]
    InvalidWindow { low: f64, high: f64 },
}

/// A failure caused by the shape of the signal rather than by the data source.
///
/// The peak locator converts these into an [`AreaStatus`](crate::peak::AreaStatus)
/// instead of failing the whole analyte.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantificationError {
    #[error("The chromatogram for {low:.4}-{high:.4} contained no signal")]
    EmptyChromatogram { low: f64, high: f64 },
    #[error("The trace around {0:.3} is too narrow to define a peak")]
    DegenerateTrace(f64),
    #[error("The m/z profile around {0:.4} contained no signal")]
    EmptyProfile(f64),
    #[error("The m/z profile peak at {observed:.4} is too far from {expected:.4}")]
    ProfileOffTarget { expected: f64, observed: f64 },
    #[error("The m/z profile peak at {mz:.4} spans only {width:.5}")]
    MzRangeTooShort { mz: f64, width: f64 },
}

impl QuantificationError {
    /// The status a peak is given when quantifying it failed this way
    pub fn status(&self) -> AreaStatus {
        match self {
            Self::MzRangeTooShort { .. } => AreaStatus::MzRangeTooShort,
            _ => AreaStatus::TooSmall,
        }
    }
}

/// The public error type of a detection call
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to read raw data: {0}")]
    Store(
        #[source]
        #[from]
        StoreError,
    ),
    #[error("Failed to quantify peak: {0}")]
    Quantification(
        #[source]
        #[from]
        QuantificationError,
    ),
    #[error("Isotope channel {0} has no peaks left within the requested limits")]
    EmptyChannel(usize),
    #[error("The analyte target is invalid: {0}")]
    InvalidTarget(String),
}

/// A read-only source of raw LC-MS signal.
///
/// All reads are by m/z window, time window and MS level. Implementations are
/// free to cache internally, but the locator never mutates the source.
pub trait ChromatogramSource {
    /// Sum the intensity of all signal in `mz_low..=mz_high` for every scan of
    /// `ms_level`, in acquisition order.
    fn read_chromatogram(
        &self,
        mz_low: f64,
        mz_high: f64,
        ms_level: u8,
    ) -> Result<Chromatogram, StoreError>;

    /// Build an m/z-binned intensity profile of the signal within `mz_tolerance`
    /// of `mz_center`, summed over scans within `time_tolerance` of `time_center`.
    fn read_profile(
        &self,
        mz_center: f64,
        mz_tolerance: f64,
        time_center: f64,
        time_tolerance: f64,
        ms_level: u8,
    ) -> Result<MzProfile, StoreError>;

    /// Fetch the individual raw points inside a time × m/z rectangle.
    fn read_points(
        &self,
        mz_low: f64,
        mz_high: f64,
        time_low: f64,
        time_high: f64,
        ms_level: u8,
    ) -> Result<Vec<SignalPoint>, StoreError>;

    /// The mapping from scan number to retention time for `ms_level`
    fn retention_times(&self, ms_level: u8) -> Result<BTreeMap<u32, f64>, StoreError>;

    /// Prepare any per-level index needed by fragment spectrum consumers, returning
    /// the number of scans indexed.
    fn prepare_msn_cache(&self, ms_level: u8) -> Result<usize, StoreError> {
        let _ = ms_level;
        Ok(0)
    }
}

impl<T: ChromatogramSource + ?Sized> ChromatogramSource for &T {
    fn read_chromatogram(
        &self,
        mz_low: f64,
        mz_high: f64,
        ms_level: u8,
    ) -> Result<Chromatogram, StoreError> {
        (**self).read_chromatogram(mz_low, mz_high, ms_level)
    }

    fn read_profile(
        &self,
        mz_center: f64,
        mz_tolerance: f64,
        time_center: f64,
        time_tolerance: f64,
        ms_level: u8,
    ) -> Result<MzProfile, StoreError> {
        (**self).read_profile(mz_center, mz_tolerance, time_center, time_tolerance, ms_level)
    }

    fn read_points(
        &self,
        mz_low: f64,
        mz_high: f64,
        time_low: f64,
        time_high: f64,
        ms_level: u8,
    ) -> Result<Vec<SignalPoint>, StoreError> {
        (**self).read_points(mz_low, mz_high, time_low, time_high, ms_level)
    }

    fn retention_times(&self, ms_level: u8) -> Result<BTreeMap<u32, f64>, StoreError> {
        (**self).retention_times(ms_level)
    }

    fn prepare_msn_cache(&self, ms_level: u8) -> Result<usize, StoreError> {
        (**self).prepare_msn_cache(ms_level)
    }
}
