//! The peak data model shared by every stage of detection
use std::fmt::Display;
use std::hash;

use num_traits::Float;

#[inline]
pub(crate) fn isclose<T: Float>(a: T, b: T, delta: T) -> bool {
    (a - b).abs() <= delta
}

/// The outcome of quantifying a peak
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AreaStatus {
    #[default]
    Ok,
    /// The signal was too weak or too narrow to form a peak
    TooSmall,
    /// The peak duplicates one that was already accepted
    Duplicate,
    /// The peak belongs to the isotope envelope of another peak
    OtherIso,
    /// There was no signal at the requested position
    NothingThere,
    /// The m/z profile peak was narrower than allowed
    MzRangeTooShort,
    /// The requested position lies inside a peak that was already accepted
    AlreadyUsed,
}

impl Display for AreaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A chromatographic peak in one isotope channel.
///
/// Times are in the units of the [`ChromatogramSource`](crate::traits::ChromatogramSource)
/// the peak was read from. The m/z band is stored as distances below and above `mz`.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Peak {
    pub mz: f64,
    pub lower_mz_band: f64,
    pub upper_mz_band: f64,
    pub lower_valley: f64,
    pub apex: f64,
    pub upper_valley: f64,
    pub area: f64,
    pub area_error: f64,
    pub background: f64,
    pub apex_intensity: f32,
    pub charge: i32,
    pub isotope: usize,
    /// A border was placed by the steepness-reduction algorithm
    pub greedy: bool,
    pub status: AreaStatus,
}

impl Peak {
    /// An unquantified peak carrying only its identity and a status
    pub fn empty(mz: f64, charge: i32, isotope: usize, status: AreaStatus) -> Self {
        Self {
            mz,
            charge,
            isotope,
            status,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, AreaStatus::Ok)
    }

    pub fn width(&self) -> f64 {
        self.upper_valley - self.lower_valley
    }

    pub fn lower_mz(&self) -> f64 {
        self.mz - self.lower_mz_band
    }

    pub fn upper_mz(&self) -> f64 {
        self.mz + self.upper_mz_band
    }

    pub fn contains_time(&self, time: f64) -> bool {
        self.lower_valley <= time && time <= self.upper_valley
    }

    /// Whether `time` is close enough to this peak's apex to be the same elution event.
    ///
    /// The distance is compared against the width of the side `time` falls on divided by
    /// `side_divisor`, and against the full width divided by `full_divisor`.
    pub fn in_inner_region(&self, time: f64, side_divisor: f64, full_divisor: f64) -> bool {
        let delta = (time - self.apex).abs();
        let side = if time >= self.apex {
            self.upper_valley - self.apex
        } else {
            self.apex - self.lower_valley
        };
        delta < side / side_divisor || delta < self.width() / full_divisor
    }
}

/// An axis-aligned ellipse in time × m/z
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ellipse {
    pub time_center: f64,
    pub time_stretch: f64,
    pub mz_center: f64,
    pub mz_stretch: f64,
}

impl Ellipse {
    pub fn new(time_center: f64, time_stretch: f64, mz_center: f64, mz_stretch: f64) -> Self {
        Self {
            time_center,
            time_stretch,
            mz_center,
            mz_stretch,
        }
    }

    /// Whether `(time, mz)` lies strictly inside the ellipse. A degenerate ellipse
    /// contains nothing.
    pub fn contains(&self, time: f64, mz: f64) -> bool {
        if self.time_stretch <= 0.0 || self.mz_stretch <= 0.0 {
            return false;
        }
        let t = (time - self.time_center) / self.time_stretch;
        let m = (mz - self.mz_center) / self.mz_stretch;
        t * t + m * m < 1.0
    }

    pub fn time_bounds(&self) -> (f64, f64) {
        (
            self.time_center - self.time_stretch,
            self.time_center + self.time_stretch,
        )
    }

    pub fn mz_bounds(&self) -> (f64, f64) {
        (
            self.mz_center - self.mz_stretch,
            self.mz_center + self.mz_stretch,
        )
    }
}

/// Which sides of a peak run into neighboring signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OverlapFlags {
    pub before: bool,
    pub after: bool,
    pub lower_mz: bool,
    pub higher_mz: bool,
}

impl OverlapFlags {
    pub fn any(&self) -> bool {
        self.before || self.after || self.lower_mz || self.higher_mz
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            before: self.before || other.before,
            after: self.after || other.after,
            lower_mz: self.lower_mz || other.lower_mz,
            higher_mz: self.higher_mz || other.higher_mz,
        }
    }
}

/// A peak integrated inside an ellipse in time × m/z
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Peak3D {
    pub peak: Peak,
    pub ellipse: Ellipse,
    pub overlap: OverlapFlags,
}

/// A detected peak, either integrated along time alone or over a time × m/z region.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Probe {
    Flat(Peak),
    Volume(Peak3D),
}

impl Probe {
    pub fn peak(&self) -> &Peak {
        match self {
            Probe::Flat(p) => p,
            Probe::Volume(p) => &p.peak,
        }
    }

    pub fn peak_mut(&mut self) -> &mut Peak {
        match self {
            Probe::Flat(p) => p,
            Probe::Volume(p) => &mut p.peak,
        }
    }

    pub fn ellipse(&self) -> Option<&Ellipse> {
        match self {
            Probe::Flat(_) => None,
            Probe::Volume(p) => Some(&p.ellipse),
        }
    }

    pub fn overlap(&self) -> OverlapFlags {
        match self {
            Probe::Flat(_) => OverlapFlags::default(),
            Probe::Volume(p) => p.overlap,
        }
    }

    pub fn status(&self) -> AreaStatus {
        self.peak().status
    }

    pub fn is_ok(&self) -> bool {
        self.peak().is_ok()
    }

    pub fn with_status(mut self, status: AreaStatus) -> Self {
        self.peak_mut().status = status;
        self
    }

    pub fn into_peak(self) -> Peak {
        match self {
            Probe::Flat(p) => p,
            Probe::Volume(p) => p.peak,
        }
    }
}

impl From<Peak> for Probe {
    fn from(value: Peak) -> Self {
        Self::Flat(value)
    }
}

impl From<Peak3D> for Probe {
    fn from(value: Peak3D) -> Self {
        Self::Volume(value)
    }
}

/// The epsilons two peaks must agree within to be considered the same detection
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakTolerance {
    pub area: f64,
    pub time: f64,
    pub mz: f64,
}

impl Default for PeakTolerance {
    fn default() -> Self {
        Self {
            area: 0.02,
            time: 0.02,
            mz: 0.001,
        }
    }
}

impl PeakTolerance {
    pub fn new(area: f64, time: f64, mz: f64) -> Self {
        Self { area, time, mz }
    }
}

/// Compare two peaks field by field within `tolerance`.
///
/// This is the single notion of "the same peak" used by duplicate removal and by
/// the per-call caches.
pub fn approx_equal(a: &Peak, b: &Peak, tolerance: &PeakTolerance) -> bool {
    isclose(a.area, b.area, tolerance.area)
        && isclose(a.area_error, b.area_error, tolerance.area)
        && isclose(a.background, b.background, tolerance.area)
        && isclose(a.mz, b.mz, tolerance.mz)
        && isclose(a.lower_mz_band, b.lower_mz_band, tolerance.mz)
        && isclose(a.upper_mz_band, b.upper_mz_band, tolerance.mz)
        && isclose(a.lower_valley, b.lower_valley, tolerance.time)
        && isclose(a.apex, b.apex, tolerance.time)
        && isclose(a.upper_valley, b.upper_valley, tolerance.time)
}

/// A hashable key for a peak that compares with [`approx_equal`].
///
/// Only the integral fields participate in the hash so that peaks within tolerance
/// always land in the same bucket.
#[derive(Debug, Clone)]
pub struct PeakKey {
    pub peak: Peak,
    pub tolerance: PeakTolerance,
}

impl PeakKey {
    pub fn new(peak: Peak, tolerance: PeakTolerance) -> Self {
        Self { peak, tolerance }
    }
}

impl PartialEq for PeakKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.peak.charge == other.peak.charge
            && self.peak.isotope == other.peak.isotope
            && approx_equal(&self.peak, &other.peak, &self.tolerance)
    }
}

impl Eq for PeakKey {}

impl hash::Hash for PeakKey {
    #[inline]
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.peak.charge.hash(state);
        self.peak.isotope.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn make_peak(area: f64, apex: f64) -> Peak {
        Peak {
            mz: 760.585,
            lower_mz_band: 0.005,
            upper_mz_band: 0.005,
            lower_valley: apex - 10.0,
            apex,
            upper_valley: apex + 12.0,
            area,
            charge: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_approx_equal() {
        let tol = PeakTolerance::default();
        let a = make_peak(1000.0, 50.0);
        let mut b = a.clone();
        b.area += 0.01;
        b.apex += 0.015;
        b.mz += 0.0005;
        assert!(approx_equal(&a, &b, &tol));
        b.area += 0.05;
        assert!(!approx_equal(&a, &b, &tol));
        let mut c = a.clone();
        c.upper_valley += 0.1;
        assert!(!approx_equal(&a, &c, &tol));
    }

    #[test]
    fn test_peak_key_lookup() {
        let tol = PeakTolerance::default();
        let mut cache = HashMap::new();
        cache.insert(PeakKey::new(make_peak(1000.0, 50.0), tol), 1);
        assert_eq!(
            cache.get(&PeakKey::new(make_peak(1000.01, 50.01), tol)),
            Some(&1)
        );
        assert_eq!(cache.get(&PeakKey::new(make_peak(1000.5, 50.0), tol)), None);
        let mut other_channel = make_peak(1000.0, 50.0);
        other_channel.isotope = 1;
        assert_eq!(cache.get(&PeakKey::new(other_channel, tol)), None);
    }

    #[test]
    fn test_inner_region() {
        let p = make_peak(1000.0, 50.0);
        // right side is 12 wide, left side is 10 wide, full width 22
        assert!(p.in_inner_region(53.9, 3.0, 6.0));
        assert!(!p.in_inner_region(54.1, 3.0, 6.0));
        assert!(p.in_inner_region(46.5, 3.0, 6.0));
        assert!(!p.in_inner_region(46.0, 3.0, 6.0));
    }

    #[test]
    fn test_ellipse_contains() {
        let e = Ellipse::new(50.0, 10.0, 500.0, 0.01);
        assert!(e.contains(50.0, 500.0));
        assert!(e.contains(55.0, 500.005));
        assert!(!e.contains(60.0, 500.0));
        assert!(!e.contains(50.0, 500.011));
        assert!(!Ellipse::new(50.0, 0.0, 500.0, 0.01).contains(50.0, 500.0));
    }
}
