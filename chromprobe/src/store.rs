//! An in-memory [`ChromatogramSource`] over centroided or profile scans
use std::collections::{BTreeMap, HashMap};

use identity_hash::BuildIdentityHasher;
use tracing::debug;

use crate::chromatogram::{Chromatogram, MzProfile, SignalPoint};
use crate::traits::{ChromatogramSource, StoreError};

/// The signal of a single scan, sorted by m/z
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSignal {
    pub mzs: Vec<f64>,
    pub intensities: Vec<f32>,
}

impl ScanSignal {
    pub fn new(mzs: Vec<f64>, intensities: Vec<f32>) -> Self {
        let mut pairs: Vec<(f64, f32)> = mzs.into_iter().zip(intensities).collect();
        if !pairs.windows(2).all(|w| w[0].0 <= w[1].0) {
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
        let (mzs, intensities) = pairs.into_iter().unzip();
        Self { mzs, intensities }
    }

    pub fn len(&self) -> usize {
        self.mzs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mzs.is_empty()
    }

    fn index_range(&self, mz_low: f64, mz_high: f64) -> std::ops::Range<usize> {
        let start = self.mzs.partition_point(|mz| *mz < mz_low);
        let end = self.mzs.partition_point(|mz| *mz <= mz_high);
        start..end.max(start)
    }

    /// The summed intensity in `mz_low..=mz_high`
    pub fn intensity_between(&self, mz_low: f64, mz_high: f64) -> f32 {
        self.intensities[self.index_range(mz_low, mz_high)]
            .iter()
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
struct LevelIndex {
    scan_numbers: Vec<u32>,
    times: Vec<f64>,
    scans: Vec<ScanSignal>,
    by_scan_number: HashMap<u32, usize, BuildIdentityHasher<u32>>,
}

impl LevelIndex {
    fn insert(&mut self, scan_number: u32, time: f64, signal: ScanSignal) {
        let at = self.times.partition_point(|t| *t <= time);
        self.scan_numbers.insert(at, scan_number);
        self.times.insert(at, time);
        self.scans.insert(at, signal);
        if at + 1 == self.times.len() {
            self.by_scan_number.insert(scan_number, at);
        } else {
            self.by_scan_number = self
                .scan_numbers
                .iter()
                .enumerate()
                .map(|(i, s)| (*s, i))
                .collect();
        }
    }

    fn time_range(&self, time_low: f64, time_high: f64) -> std::ops::Range<usize> {
        let start = self.times.partition_point(|t| *t < time_low);
        let end = self.times.partition_point(|t| *t <= time_high);
        start..end.max(start)
    }
}

/// Scans held in memory, grouped by MS level and ordered by time.
///
/// Profiles are binned at `profile_bin_width` m/z.
#[derive(Debug, Clone)]
pub struct ScanStore {
    levels: BTreeMap<u8, LevelIndex>,
    pub profile_bin_width: f64,
}

impl Default for ScanStore {
    fn default() -> Self {
        Self::new(0.0005)
    }
}

impl ScanStore {
    pub fn new(profile_bin_width: f64) -> Self {
        Self {
            levels: BTreeMap::new(),
            profile_bin_width,
        }
    }

    /// Add a scan. Scans may be pushed in any order; they are kept sorted by time.
    pub fn push_scan(
        &mut self,
        ms_level: u8,
        scan_number: u32,
        time: f64,
        mzs: Vec<f64>,
        intensities: Vec<f32>,
    ) {
        self.levels
            .entry(ms_level)
            .or_default()
            .insert(scan_number, time, ScanSignal::new(mzs, intensities));
    }

    pub fn ms_levels(&self) -> impl Iterator<Item = u8> + '_ {
        self.levels.keys().copied()
    }

    pub fn num_scans(&self, ms_level: u8) -> usize {
        self.levels.get(&ms_level).map(|l| l.times.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(|l| l.times.is_empty())
    }

    /// The signal of a scan looked up by its scan number
    pub fn get_scan(&self, ms_level: u8, scan_number: u32) -> Option<(f64, &ScanSignal)> {
        let level = self.levels.get(&ms_level)?;
        let i = *level.by_scan_number.get(&scan_number)?;
        Some((level.times[i], &level.scans[i]))
    }

    fn level(&self, ms_level: u8) -> Result<&LevelIndex, StoreError> {
        self.levels
            .get(&ms_level)
            .ok_or(StoreError::MsLevelNotAvailable(ms_level))
    }
}

fn check_window(low: f64, high: f64) -> Result<(), StoreError> {
    if low.is_nan() || high.is_nan() || low > high {
        Err(StoreError::InvalidWindow { low, high })
    } else {
        Ok(())
    }
}

impl ChromatogramSource for ScanStore {
    fn read_chromatogram(
        &self,
        mz_low: f64,
        mz_high: f64,
        ms_level: u8,
    ) -> Result<Chromatogram, StoreError> {
        check_window(mz_low, mz_high)?;
        let level = self.level(ms_level)?;
        let raw = level
            .scans
            .iter()
            .map(|s| s.intensity_between(mz_low, mz_high))
            .collect();
        Ok(Chromatogram::new(
            mz_low,
            mz_high,
            ms_level,
            level.scan_numbers.clone(),
            level.times.clone(),
            raw,
        ))
    }

    fn read_profile(
        &self,
        mz_center: f64,
        mz_tolerance: f64,
        time_center: f64,
        time_tolerance: f64,
        ms_level: u8,
    ) -> Result<MzProfile, StoreError> {
        check_window(mz_center - mz_tolerance, mz_center + mz_tolerance)?;
        check_window(time_center - time_tolerance, time_center + time_tolerance)?;
        let level = self.level(ms_level)?;
        let width = self.profile_bin_width;
        if width <= 0.0 {
            return Err(StoreError::InvalidWindow {
                low: 0.0,
                high: width,
            });
        }
        let origin = mz_center - mz_tolerance;
        let n_bins = ((2.0 * mz_tolerance) / width - 1e-6).ceil().max(0.0) as usize + 1;
        let mzs: Vec<f64> = (0..n_bins).map(|i| origin + i as f64 * width).collect();
        let mut raw = vec![0.0f32; n_bins];

        let time_low = time_center - time_tolerance;
        let time_high = time_center + time_tolerance;
        for scan in &level.scans[level.time_range(time_low, time_high)] {
            let points = scan.index_range(origin - width / 2.0, origin + (n_bins as f64 - 0.5) * width);
            for (mz, inten) in scan.mzs[points.clone()].iter().zip(&scan.intensities[points]) {
                let bin = ((mz - origin) / width).round().max(0.0) as usize;
                raw[bin.min(n_bins - 1)] += *inten;
            }
        }
        Ok(MzProfile::new(time_low, time_high, mzs, raw))
    }

    fn read_points(
        &self,
        mz_low: f64,
        mz_high: f64,
        time_low: f64,
        time_high: f64,
        ms_level: u8,
    ) -> Result<Vec<SignalPoint>, StoreError> {
        check_window(mz_low, mz_high)?;
        check_window(time_low, time_high)?;
        let level = self.level(ms_level)?;
        let span = level.time_range(time_low, time_high);
        let mut points = Vec::new();
        for (time, scan) in level.times[span.clone()].iter().zip(&level.scans[span]) {
            let range = scan.index_range(mz_low, mz_high);
            points.extend(
                scan.mzs[range.clone()]
                    .iter()
                    .zip(&scan.intensities[range])
                    .map(|(mz, inten)| SignalPoint::new(*time, *mz, *inten)),
            );
        }
        Ok(points)
    }

    fn retention_times(&self, ms_level: u8) -> Result<BTreeMap<u32, f64>, StoreError> {
        let level = self.level(ms_level)?;
        Ok(level
            .scan_numbers
            .iter()
            .copied()
            .zip(level.times.iter().copied())
            .collect())
    }

    fn prepare_msn_cache(&self, ms_level: u8) -> Result<usize, StoreError> {
        let n: usize = self
            .levels
            .range(ms_level.max(2)..)
            .map(|(_, l)| l.times.len())
            .sum();
        debug!("{n} scans available at MS level {ms_level} and above");
        Ok(n)
    }
}
