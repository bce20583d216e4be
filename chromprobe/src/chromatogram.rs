//! Intensity traces in time and m/z, and the smoothing strategy applied to them
use std::ops::Range;

use itertools::Itertools;

/// A single raw sample of signal
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalPoint {
    pub time: f64,
    pub mz: f64,
    pub intensity: f32,
}

impl SignalPoint {
    pub fn new(time: f64, mz: f64, intensity: f32) -> Self {
        Self {
            time,
            mz,
            intensity,
        }
    }
}

/// A strategy for smoothing a one dimensional intensity trace.
///
/// Implementations must be pure: the same coordinates, intensities, range and
/// number of repeats always produce the same output, of the same length.
pub trait Smoother {
    /// Smooth `intensities` sampled at `coordinates` (sorted ascending) using a window
    /// spanning `range` coordinate units, applied `repeats` times.
    fn smooth(&self, coordinates: &[f64], intensities: &[f32], range: f64, repeats: u32) -> Vec<f32>;
}

/// A repeated moving mean over all samples within half of `range` of each position.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MeanSmoother;

impl Smoother for MeanSmoother {
    fn smooth(&self, coordinates: &[f64], intensities: &[f32], range: f64, repeats: u32) -> Vec<f32> {
        debug_assert_eq!(coordinates.len(), intensities.len());
        let n = intensities.len().min(coordinates.len());
        if range <= 0.0 || repeats == 0 || n < 2 {
            return intensities.to_vec();
        }
        let half = range / 2.0;
        let slack = half * 1e-9;

        let mut windows = Vec::with_capacity(n);
        let mut lo = 0;
        let mut hi = 0;
        for (i, c) in coordinates.iter().take(n).enumerate() {
            while coordinates[lo] < c - half - slack {
                lo += 1;
            }
            hi = hi.max(i);
            while hi + 1 < n && coordinates[hi + 1] <= c + half + slack {
                hi += 1;
            }
            windows.push((lo, hi));
        }

        let mut current: Vec<f64> = intensities[..n].iter().map(|v| *v as f64).collect();
        let mut prefix = vec![0.0f64; n + 1];
        for _ in 0..repeats {
            for (i, v) in current.iter().enumerate() {
                prefix[i + 1] = prefix[i] + v;
            }
            for (v, (lo, hi)) in current.iter_mut().zip(windows.iter()) {
                *v = (prefix[hi + 1] - prefix[*lo]) / (hi - lo + 1) as f64;
            }
        }
        current.into_iter().map(|v| v as f32).collect()
    }
}

/// The duration a sample represents, using the midpoint between its neighbors.
pub(crate) fn sample_width(coordinates: &[f64], i: usize) -> f64 {
    let n = coordinates.len();
    match n {
        0 => 0.0,
        1 => 1.0,
        _ => {
            if i == 0 {
                coordinates[1] - coordinates[0]
            } else if i + 1 >= n {
                coordinates[n - 1] - coordinates[n - 2]
            } else {
                (coordinates[i + 1] - coordinates[i - 1]) / 2.0
            }
        }
    }
}

fn nearest_index(coordinates: &[f64], value: f64) -> Option<usize> {
    if coordinates.is_empty() {
        return None;
    }
    let i = coordinates.partition_point(|c| *c < value);
    if i == 0 {
        Some(0)
    } else if i == coordinates.len() {
        Some(i - 1)
    } else if (coordinates[i] - value).abs() < (value - coordinates[i - 1]).abs() {
        Some(i)
    } else {
        Some(i - 1)
    }
}

fn index_range(coordinates: &[f64], low: f64, high: f64) -> Range<usize> {
    let start = coordinates.partition_point(|c| *c < low);
    let end = coordinates.partition_point(|c| *c <= high);
    start..end.max(start)
}

/// The summed intensity of an m/z window over all scans of one MS level.
///
/// `smoothed` is a copy of `raw` until [`Chromatogram::smooth`] is called.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chromatogram {
    pub mz_low: f64,
    pub mz_high: f64,
    pub ms_level: u8,
    pub scan_numbers: Vec<u32>,
    pub times: Vec<f64>,
    pub raw: Vec<f32>,
    pub smoothed: Vec<f32>,
}

impl Chromatogram {
    pub fn new(
        mz_low: f64,
        mz_high: f64,
        ms_level: u8,
        scan_numbers: Vec<u32>,
        times: Vec<f64>,
        raw: Vec<f32>,
    ) -> Self {
        let smoothed = raw.clone();
        Self {
            mz_low,
            mz_high,
            ms_level,
            scan_numbers,
            times,
            raw,
            smoothed,
        }
    }

    /// Build a chromatogram from a plain intensity vector, numbering scans and times
    /// from zero with unit spacing.
    pub fn from_intensities(mz: f64, raw: Vec<f32>) -> Self {
        let n = raw.len();
        Self::new(
            mz,
            mz,
            1,
            (0..n as u32).collect(),
            (0..n).map(|i| i as f64).collect(),
            raw,
        )
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The center of the m/z window this chromatogram integrates
    pub fn mz(&self) -> f64 {
        (self.mz_low + self.mz_high) / 2.0
    }

    /// Whether there is no positive intensity anywhere in the trace
    pub fn is_blank(&self) -> bool {
        !self.raw.iter().any(|v| *v > 0.0)
    }

    pub fn smooth<S: Smoother + ?Sized>(&mut self, smoother: &S, range: f64, repeats: u32) {
        self.smoothed = smoother.smooth(&self.times, &self.raw, range, repeats);
    }

    pub fn max_smoothed(&self) -> f32 {
        self.smoothed.iter().copied().fold(0.0, f32::max)
    }

    pub fn index_of_time(&self, time: f64) -> Option<usize> {
        nearest_index(&self.times, time)
    }

    /// The indices of all samples with `low <= time <= high`
    pub fn indices_between(&self, low: f64, high: f64) -> Range<usize> {
        index_range(&self.times, low, high)
    }

    /// The indices of all samples with `low < time < high`
    pub fn indices_strictly_between(&self, low: f64, high: f64) -> Range<usize> {
        let start = self.times.partition_point(|t| *t <= low);
        let end = self.times.partition_point(|t| *t < high);
        start..end.max(start)
    }

    pub fn sample_width(&self, index: usize) -> f64 {
        sample_width(&self.times, index)
    }

    /// Integrate the raw trace over `lower..=upper`
    pub fn raw_area(&self, lower: usize, upper: usize) -> f64 {
        self.integrate(&self.raw, lower, upper)
    }

    /// Integrate the smoothed trace over `lower..=upper`
    pub fn smoothed_area(&self, lower: usize, upper: usize) -> f64 {
        self.integrate(&self.smoothed, lower, upper)
    }

    fn integrate(&self, values: &[f32], lower: usize, upper: usize) -> f64 {
        if values.is_empty() || lower > upper {
            return 0.0;
        }
        let upper = upper.min(values.len() - 1);
        (lower..=upper)
            .map(|i| values[i] as f64 * self.sample_width(i))
            .sum()
    }

    /// The index and raw intensity of the most intense raw sample in `lower..=upper`
    pub fn raw_apex_between(&self, lower: usize, upper: usize) -> Option<(usize, f32)> {
        if self.is_empty() || lower > upper {
            return None;
        }
        let upper = upper.min(self.len() - 1);
        let offset = self.raw[lower..=upper]
            .iter()
            .position_max_by(|a, b| a.total_cmp(b))?;
        Some((lower + offset, self.raw[lower + offset]))
    }

    /// The smallest value of `values` from one index to the other, both ends included,
    /// in either order
    pub(crate) fn min_between(values: &[f32], a: usize, b: usize) -> Option<f32> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if values.is_empty() || hi >= values.len() {
            return None;
        }
        values[lo..=hi].iter().copied().reduce(f32::min)
    }

    /// Local maxima of the smoothed trace at or above `threshold`, most intense first
    pub fn local_maxima(&self, threshold: f32) -> Vec<usize> {
        let s = &self.smoothed;
        let n = s.len();
        let mut maxima: Vec<usize> = (0..n)
            .filter(|i| {
                let i = *i;
                let v = s[i];
                if v <= 0.0 || v < threshold {
                    return false;
                }
                let left_ok = i == 0 || s[i - 1] < v;
                let right_ok = i + 1 >= n || s[i + 1] <= v;
                left_ok && right_ok
            })
            .collect();
        maxima.sort_by(|a, b| s[*b].total_cmp(&s[*a]).then(a.cmp(b)));
        maxima
    }
}

/// An m/z-binned intensity profile summed over a time window
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MzProfile {
    pub time_low: f64,
    pub time_high: f64,
    pub mzs: Vec<f64>,
    pub raw: Vec<f32>,
    pub smoothed: Vec<f32>,
}

impl MzProfile {
    pub fn new(time_low: f64, time_high: f64, mzs: Vec<f64>, raw: Vec<f32>) -> Self {
        let smoothed = raw.clone();
        Self {
            time_low,
            time_high,
            mzs,
            raw,
            smoothed,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn is_blank(&self) -> bool {
        !self.raw.iter().any(|v| *v > 0.0)
    }

    pub fn smooth<S: Smoother + ?Sized>(&mut self, smoother: &S, range: f64, repeats: u32) {
        self.smoothed = smoother.smooth(&self.mzs, &self.raw, range, repeats);
    }

    pub fn index_of_mz(&self, mz: f64) -> Option<usize> {
        nearest_index(&self.mzs, mz)
    }

    /// The smoothed-intensity weighted mean m/z over `lower..=upper`
    pub fn centroid_between(&self, lower: usize, upper: usize) -> Option<f64> {
        if self.is_empty() || lower > upper {
            return None;
        }
        let upper = upper.min(self.len() - 1);
        let (weighted, total) = (lower..=upper).fold((0.0, 0.0), |(w, t), i| {
            let v = self.smoothed[i] as f64;
            (w + v * self.mzs[i], t + v)
        });
        if total > 0.0 {
            Some(weighted / total)
        } else {
            None
        }
    }
}
