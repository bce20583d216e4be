/*! Coarse-to-fine peak location in time × m/z.

A candidate position on a channel's coarse chromatogram is first bounded in time,
then an m/z profile at its apex fixes the m/z center and width, and a small and a broad
chromatogram re-extracted at that center confirm the time borders. The final peak is
the raw signal integrated inside an ellipse fitted to those borders.
*/
use std::rc::Rc;

use tracing::{debug, instrument, trace};

use crate::chromatogram::{sample_width, Chromatogram, MeanSmoother, SignalPoint, Smoother};
use crate::params::DetectionParams;
use crate::peak::{AreaStatus, Ellipse, OverlapFlags, Peak, Peak3D, Probe};
use crate::session::DetectionSession;
use crate::traits::{ChromatogramSource, DetectionError, QuantificationError, StoreError};
use crate::valley::{BorderStrategy, Borders, ValleyDetector};

/// The isotope channel of an analyte being searched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelTarget {
    pub mz: f64,
    pub charge: i32,
    pub isotope: usize,
    pub ms_level: u8,
}

impl ChannelTarget {
    pub fn new(mz: f64, charge: i32, isotope: usize, ms_level: u8) -> Self {
        Self {
            mz,
            charge,
            isotope,
            ms_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ProfilePeak {
    mz: f64,
    lower_mz: f64,
    upper_mz: f64,
    lower_hard: bool,
    upper_hard: bool,
}

/// Integrate raw points strictly inside `ellipse`, and strictly inside `limits` when
/// given, weighting each point by the duration of the scan it was observed in.
pub fn ellipse_area(
    points: &[SignalPoint],
    scan_times: &[f64],
    ellipse: &Ellipse,
    limits: Option<(f64, f64)>,
) -> f64 {
    points
        .iter()
        .filter(|p| ellipse.contains(p.time, p.mz))
        .filter(|p| limits.map_or(true, |(lo, hi)| p.time > lo && p.time < hi))
        .map(|p| {
            let i = scan_times.partition_point(|t| *t < p.time);
            let i = if i >= scan_times.len() {
                scan_times.len().saturating_sub(1)
            } else if i > 0 && (p.time - scan_times[i - 1]) < (scan_times[i] - p.time) {
                i - 1
            } else {
                i
            };
            p.intensity as f64 * sample_width(scan_times, i)
        })
        .sum()
}

fn nearest_signal(values: &[f32], start: usize) -> Option<usize> {
    let n = values.len();
    (0..n).find_map(|d| {
        if start >= d && values[start - d] > 0.0 {
            Some(start - d)
        } else if start + d < n && values[start + d] > 0.0 {
            Some(start + d)
        } else {
            None
        }
    })
}

/// Locates and quantifies single peaks of one analyte against a [`ChromatogramSource`]
#[derive(Debug)]
pub struct PeakLocator<'a, S: ChromatogramSource + ?Sized, M: Smoother + ?Sized = MeanSmoother> {
    pub source: &'a S,
    pub smoother: &'a M,
    pub params: &'a DetectionParams,
    pub detector: ValleyDetector,
}

impl<'a, S: ChromatogramSource + ?Sized, M: Smoother + ?Sized> PeakLocator<'a, S, M> {
    pub fn new(source: &'a S, smoother: &'a M, params: &'a DetectionParams) -> Self {
        Self {
            source,
            smoother,
            params,
            detector: ValleyDetector::from(params),
        }
    }

    /// Read a chromatogram and smooth it with the configured smoother
    pub fn read_smoothed(
        &self,
        mz_low: f64,
        mz_high: f64,
        ms_level: u8,
    ) -> Result<Chromatogram, StoreError> {
        let mut chrom = self.source.read_chromatogram(mz_low, mz_high, ms_level)?;
        chrom.smooth(
            self.smoother,
            self.params.chrom_smooth_range,
            self.params.chrom_smooth_repeats,
        );
        Ok(chrom)
    }

    /// The smoothed coarse chromatogram of a channel, read once per session
    pub fn read_channel(
        &self,
        session: &mut DetectionSession,
        target: &ChannelTarget,
    ) -> Result<Rc<Chromatogram>, StoreError> {
        let (low, high) = self.params.coarse_tolerance.bounds(target.mz);
        session.channel_trace(target.isotope, || {
            self.read_smoothed(low, high, target.ms_level)
        })
    }

    /// The sorted scan times of `ms_level`, read once per session
    pub fn scan_times(
        &self,
        session: &mut DetectionSession,
        ms_level: u8,
    ) -> Result<Rc<[f64]>, StoreError> {
        session.scan_times(ms_level, || {
            let mut times: Vec<f64> = self.source.retention_times(ms_level)?.into_values().collect();
            times.sort_by(|a, b| a.total_cmp(b));
            Ok(times)
        })
    }

    /// Integrate the raw signal inside `ellipse`, optionally clipped to a time window
    pub fn integrate_ellipse(
        &self,
        session: &mut DetectionSession,
        ellipse: &Ellipse,
        ms_level: u8,
        limits: Option<(f64, f64)>,
    ) -> Result<f64, StoreError> {
        let (t_lo, t_hi) = ellipse.time_bounds();
        let (m_lo, m_hi) = ellipse.mz_bounds();
        if !(t_lo < t_hi && m_lo < m_hi) {
            return Ok(0.0);
        }
        let points = self.source.read_points(m_lo, m_hi, t_lo, t_hi, ms_level)?;
        let times = self.scan_times(session, ms_level)?;
        Ok(ellipse_area(&points, &times, ellipse, limits))
    }

    /// Detect a time-only peak around `start`, applying the shoulder fallback when
    /// the configured strategy records steepness points.
    pub fn detect_time_peak(
        &self,
        chrom: &Chromatogram,
        start: usize,
        target: &ChannelTarget,
    ) -> (Peak, Option<Borders>) {
        let strategy = self.params.border_strategy();
        let (mut peak, borders) = self.detector.detect_with_borders(chrom, start, strategy);
        let borders = match borders {
            Some(b) if strategy == BorderStrategy::GreedyWithSteepnessPoint => {
                let b = self.detector.resolve_shoulders(&chrom.times, b);
                peak = self.detector.peak_from_borders(chrom, &b);
                Some(b)
            }
            b => b,
        };
        peak.charge = target.charge;
        peak.isotope = target.isotope;
        (peak, borders)
    }

    /// Locate the peak nearest `start` on the coarse chromatogram and refine it in m/z.
    ///
    /// Only data source failures are returned as errors. Any failure caused by the shape
    /// of the signal is reported through the returned peak's status.
    #[instrument(level = "debug", skip(self, session, coarse))]
    pub fn locate(
        &self,
        session: &mut DetectionSession,
        coarse: &Chromatogram,
        start: usize,
        target: &ChannelTarget,
    ) -> Result<Probe, DetectionError> {
        let highest = coarse.max_smoothed();
        if start >= coarse.len() || highest <= 0.0 {
            return Ok(Probe::Flat(Peak::empty(
                target.mz,
                target.charge,
                target.isotope,
                AreaStatus::NothingThere,
            )));
        }
        if coarse.smoothed[start] < highest * self.params.min_relative_intensity {
            trace!(
                "Intensity {} at {start} is below the cutoff of {highest}",
                coarse.smoothed[start]
            );
            return Ok(Probe::Flat(Peak::empty(
                target.mz,
                target.charge,
                target.isotope,
                AreaStatus::TooSmall,
            )));
        }

        let (coarse_peak, borders) = self.detect_time_peak(coarse, start, target);
        if !coarse_peak.is_ok() {
            return Ok(Probe::Flat(coarse_peak));
        }

        match self.refine(session, coarse, coarse_peak.clone(), borders, target) {
            Ok(peak) => Ok(Probe::Volume(peak)),
            Err(DetectionError::Quantification(err)) => {
                debug!("Failed to refine peak at {:.3}: {err}", coarse_peak.apex);
                let status = err.status();
                Ok(Probe::Flat(coarse_peak).with_status(status))
            }
            Err(err) => Err(err),
        }
    }

    fn profile_peak(
        &self,
        session: &mut DetectionSession,
        coarse_peak: &Peak,
        target: &ChannelTarget,
    ) -> Result<ProfilePeak, DetectionError> {
        let params = self.params;
        let time_tolerance = coarse_peak.width() / 2.0;
        let profile = session.profile(coarse_peak, || {
            let mut profile = self.source.read_profile(
                target.mz,
                params.profile_mz_tolerance,
                coarse_peak.apex,
                time_tolerance,
                target.ms_level,
            )?;
            profile.smooth(
                self.smoother,
                params.profile_smooth_range,
                params.profile_smooth_repeats,
            );
            Ok::<_, StoreError>(profile)
        })?;

        if profile.is_blank() {
            return Err(QuantificationError::EmptyProfile(target.mz).into());
        }
        let start = profile
            .index_of_mz(target.mz)
            .and_then(|i| nearest_signal(&profile.smoothed, i))
            .ok_or(QuantificationError::EmptyProfile(target.mz))?;
        let borders = self
            .detector
            .find_borders(&profile.smoothed, start, BorderStrategy::Standard)
            .ok_or(QuantificationError::EmptyProfile(target.mz))?;

        let lower_mz = profile.mzs[borders.lower.index];
        let upper_mz = profile.mzs[borders.upper.index];
        let mz = profile
            .centroid_between(borders.lower.index, borders.upper.index)
            .unwrap_or(profile.mzs[borders.apex]);

        if (mz - target.mz).abs() > params.profile_mz_acceptance {
            return Err(QuantificationError::ProfileOffTarget {
                expected: target.mz,
                observed: mz,
            }
            .into());
        }
        let width = upper_mz - lower_mz;
        if width < params.min_profile_mz_range {
            return Err(QuantificationError::MzRangeTooShort { mz, width }.into());
        }
        trace!("Profile peak at {mz:.5} spanning {lower_mz:.5}-{upper_mz:.5}");
        Ok(ProfilePeak {
            mz,
            lower_mz,
            upper_mz,
            lower_hard: borders.lower.hard,
            upper_hard: borders.upper.hard,
        })
    }

    fn refine(
        &self,
        session: &mut DetectionSession,
        coarse: &Chromatogram,
        mut coarse_peak: Peak,
        mut coarse_borders: Option<Borders>,
        target: &ChannelTarget,
    ) -> Result<Peak3D, DetectionError> {
        let params = self.params;
        let mut iteration = 0;
        let (profile_peak, small_peak, broad) = loop {
            let profile_peak = self.profile_peak(session, &coarse_peak, target)?;

            let (low, high) = params.small_chrom_tolerance.bounds(profile_peak.mz);
            let small = session.small_chromatogram(&coarse_peak, || {
                self.read_smoothed(low, high, target.ms_level)
            })?;
            if small.is_blank() {
                return Err(QuantificationError::EmptyChromatogram { low, high }.into());
            }
            let broad = session.broad_chromatogram(&coarse_peak, || {
                self.read_smoothed(profile_peak.lower_mz, profile_peak.upper_mz, target.ms_level)
            })?;
            if broad.is_blank() {
                return Err(QuantificationError::EmptyChromatogram {
                    low: profile_peak.lower_mz,
                    high: profile_peak.upper_mz,
                }
                .into());
            }

            let start = small
                .index_of_time(coarse_peak.apex)
                .ok_or(QuantificationError::DegenerateTrace(coarse_peak.apex))?;
            let (small_peak, _) = self.detect_time_peak(&small, start, target);
            if !small_peak.is_ok() {
                return Err(QuantificationError::DegenerateTrace(coarse_peak.apex).into());
            }

            if small_peak.contains_time(coarse_peak.apex)
                || iteration >= params.max_recenter_iterations
            {
                break (profile_peak, small_peak, broad);
            }
            iteration += 1;
            debug!(
                "Coarse apex {:.3} outside of {:.3}-{:.3}, re-centering on {:.3} ({iteration})",
                coarse_peak.apex, small_peak.lower_valley, small_peak.upper_valley, small_peak.apex
            );
            let restart = coarse
                .index_of_time(small_peak.apex)
                .ok_or(QuantificationError::DegenerateTrace(small_peak.apex))?;
            let (peak, borders) = self.detect_time_peak(coarse, restart, target);
            if !peak.is_ok() {
                return Err(QuantificationError::DegenerateTrace(small_peak.apex).into());
            }
            coarse_peak = peak;
            coarse_borders = borders;
        };

        let lower = coarse_peak.lower_valley.min(small_peak.lower_valley);
        let upper = coarse_peak.upper_valley.max(small_peak.upper_valley);
        let time_cap = coarse_peak.width() / 2.0 * params.max_ellipse_time_factor;
        let mut time_stretch = (upper - lower) / 2.0;
        if time_stretch > time_cap {
            trace!("Capping ellipse time stretch {time_stretch:.3} at {time_cap:.3}");
            time_stretch = time_cap;
        }
        let mz_stretch = (profile_peak.mz - profile_peak.lower_mz)
            .max(profile_peak.upper_mz - profile_peak.mz)
            .min(params.max_ellipse_mz_stretch);
        let ellipse = Ellipse::new(
            (lower + upper) / 2.0,
            time_stretch,
            profile_peak.mz,
            mz_stretch,
        );

        let area = self.integrate_ellipse(session, &ellipse, target.ms_level, None)?;
        let (t_lo, t_hi) = ellipse.time_bounds();
        let span = broad.indices_between(t_lo, t_hi);
        if span.is_empty() {
            return Err(QuantificationError::DegenerateTrace(ellipse.time_center).into());
        }
        let (first, last) = (span.start, span.end - 1);
        let (apex_index, apex_intensity) = broad
            .raw_apex_between(first, last)
            .ok_or(QuantificationError::DegenerateTrace(ellipse.time_center))?;

        let overlap = match coarse_borders {
            Some(b) => OverlapFlags {
                before: !b.lower.hard,
                after: !b.upper.hard,
                lower_mz: !profile_peak.lower_hard,
                higher_mz: !profile_peak.upper_hard,
            },
            None => OverlapFlags {
                lower_mz: !profile_peak.lower_hard,
                higher_mz: !profile_peak.upper_hard,
                ..Default::default()
            },
        };

        let peak = Peak {
            mz: profile_peak.mz,
            lower_mz_band: profile_peak.mz - profile_peak.lower_mz,
            upper_mz_band: profile_peak.upper_mz - profile_peak.mz,
            lower_valley: t_lo,
            apex: broad.times[apex_index],
            upper_valley: t_hi,
            area,
            area_error: (broad.raw_area(first, last) - area).abs(),
            background: (broad.raw[first] as f64 + broad.raw[last] as f64) / 2.0,
            apex_intensity,
            charge: target.charge,
            isotope: target.isotope,
            greedy: coarse_peak.greedy || small_peak.greedy,
            status: if area > 0.0 {
                AreaStatus::Ok
            } else {
                AreaStatus::TooSmall
            },
        };
        debug!(
            "Located peak at {:.3} ({:.3}-{:.3}) m/z {:.4} with area {:.1}",
            peak.apex, peak.lower_valley, peak.upper_valley, peak.mz, peak.area
        );
        Ok(Peak3D {
            peak,
            ellipse,
            overlap,
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::chromatogram::MzProfile;
    use crate::params::SearchMode;
    use crate::test_data::{feature_store, SyntheticFeature};

    fn params() -> DetectionParams {
        DetectionParams::default().with_smoothing(0.2, 3)
    }

    #[test_log::test]
    fn test_locate_single_feature() {
        let feature = SyntheticFeature::new(500.0, 50.0, 10000.0, 5.0);
        let store = feature_store(&[feature], 101, 0.05);
        let params = params();
        let locator = PeakLocator::new(&store, &MeanSmoother, &params);
        let mut session = DetectionSession::new(params.peak_tolerance);
        let target = ChannelTarget::new(500.0, 1, 0, 1);
        let coarse = locator.read_channel(&mut session, &target).unwrap();
        let start = coarse.index_of_time(2.4).unwrap();
        let probe = locator.locate(&mut session, &coarse, start, &target).unwrap();

        assert!(probe.is_ok(), "{probe:?}");
        let ellipse = *probe.ellipse().unwrap();
        let peak = probe.peak();
        assert!((peak.apex - 2.5).abs() <= 0.05 + 1e-9, "{}", peak.apex);
        assert!((peak.mz - 500.0).abs() < 0.0005);
        assert!(peak.lower_valley <= peak.apex && peak.apex <= peak.upper_valley);
        assert!(ellipse.contains(peak.apex, peak.mz));

        let expected = feature.total_area(101, 0.05);
        assert!(
            ((peak.area - expected) / expected).abs() < 0.02,
            "{} vs {expected}",
            peak.area
        );
        assert!(!probe.overlap().any(), "{:?}", probe.overlap());
    }

    #[test]
    fn test_locate_below_cutoff() {
        let features = [
            SyntheticFeature::new(500.0, 30.0, 10000.0, 4.0),
            SyntheticFeature::new(500.0, 80.0, 100.0, 4.0),
        ];
        let store = feature_store(&features, 121, 0.05);
        let params = params();
        let locator = PeakLocator::new(&store, &MeanSmoother, &params);
        let mut session = DetectionSession::new(params.peak_tolerance);
        let target = ChannelTarget::new(500.0, 1, 0, 1);
        let coarse = locator.read_channel(&mut session, &target).unwrap();
        let probe = locator.locate(&mut session, &coarse, 80, &target).unwrap();
        assert_eq!(probe.status(), AreaStatus::TooSmall);
        assert!(probe.ellipse().is_none());
        // The intensity check happens before any profile is read
        assert_eq!(session.stats().misses, 1);

        let probe = locator.locate(&mut session, &coarse, 500, &target).unwrap();
        assert_eq!(probe.status(), AreaStatus::NothingThere);
    }

    #[test]
    fn test_profile_off_target() {
        // All signal sits well outside of the profile acceptance window
        let feature = SyntheticFeature::new(500.008, 40.0, 10000.0, 4.0);
        let store = feature_store(&[feature], 81, 0.05);
        let mut params = params();
        params.profile_mz_acceptance = 0.002;
        let locator = PeakLocator::new(&store, &MeanSmoother, &params);
        let mut session = DetectionSession::new(params.peak_tolerance);
        let target = ChannelTarget::new(500.0, 1, 0, 1);
        let coarse = locator.read_channel(&mut session, &target).unwrap();
        let probe = locator.locate(&mut session, &coarse, 40, &target).unwrap();
        assert_eq!(probe.status(), AreaStatus::TooSmall);

        params.profile_mz_acceptance = 0.05;
        params.min_profile_mz_range = 0.5;
        let locator = PeakLocator::new(&store, &MeanSmoother, &params);
        let mut session = DetectionSession::new(params.peak_tolerance);
        let coarse = locator.read_channel(&mut session, &target).unwrap();
        let probe = locator.locate(&mut session, &coarse, 40, &target).unwrap();
        assert_eq!(probe.status(), AreaStatus::MzRangeTooShort);
    }

    #[test]
    fn test_locate_is_cached() {
        let feature = SyntheticFeature::new(650.0, 40.0, 5000.0, 4.0);
        let store = feature_store(&[feature], 81, 0.05);
        let params = params();
        let locator = PeakLocator::new(&store, &MeanSmoother, &params);
        let mut session = DetectionSession::new(params.peak_tolerance);
        let target = ChannelTarget::new(650.0, 1, 0, 1);
        let coarse = locator.read_channel(&mut session, &target).unwrap();
        let first = locator.locate(&mut session, &coarse, 38, &target).unwrap();
        let misses = session.stats().misses;
        let second = locator.locate(&mut session, &coarse, 41, &target).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.stats().misses, misses);
    }

    fn lorentzian(n: usize, center: f64, width: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (1000.0 / (1.0 + ((i as f64 - center) / width).powi(2))) as f32)
            .collect()
    }

    /// A source whose narrow chromatograms peak far away from the apex of its wide
    /// ones, so every re-centering lands back on the same coarse peak.
    struct DisagreeingSource {
        n: usize,
    }

    impl ChromatogramSource for DisagreeingSource {
        fn read_chromatogram(
            &self,
            mz_low: f64,
            mz_high: f64,
            ms_level: u8,
        ) -> Result<Chromatogram, StoreError> {
            let raw = if mz_high - mz_low < 0.01 {
                // Long lower tail, steep drop to a valley at 64
                let mut raw = lorentzian(self.n, 60.0, 3.0);
                for (i, v) in raw.iter_mut().enumerate().skip(61) {
                    *v = if i <= 64 {
                        1000.0 - 240.0 * (i - 60) as f32
                    } else {
                        40.0 + 5.0 * (i - 64) as f32
                    };
                }
                raw
            } else {
                lorentzian(self.n, 20.0, 3.0)
            };
            Ok(Chromatogram::new(
                mz_low,
                mz_high,
                ms_level,
                (0..self.n as u32).collect(),
                (0..self.n).map(|i| i as f64).collect(),
                raw,
            ))
        }

        fn read_profile(
            &self,
            mz_center: f64,
            _mz_tolerance: f64,
            time_center: f64,
            time_tolerance: f64,
            _ms_level: u8,
        ) -> Result<MzProfile, StoreError> {
            let mzs: Vec<f64> = (0..=80).map(|i| mz_center - 0.02 + i as f64 * 0.0005).collect();
            let raw = mzs
                .iter()
                .map(|mz| (1000.0 / (1.0 + ((mz - mz_center) / 0.003).powi(2))) as f32)
                .collect();
            Ok(MzProfile::new(
                time_center - time_tolerance,
                time_center + time_tolerance,
                mzs,
                raw,
            ))
        }

        fn read_points(
            &self,
            _mz_low: f64,
            _mz_high: f64,
            _time_low: f64,
            _time_high: f64,
            _ms_level: u8,
        ) -> Result<Vec<SignalPoint>, StoreError> {
            Ok(vec![SignalPoint::new(32.0, 500.0, 100.0)])
        }

        fn retention_times(&self, _ms_level: u8) -> Result<BTreeMap<u32, f64>, StoreError> {
            Ok((0..self.n as u32).map(|i| (i, i as f64)).collect())
        }
    }

    #[test_log::test]
    fn test_recentering_is_bounded() {
        let source = DisagreeingSource { n: 100 };
        let target = ChannelTarget::new(500.0, 1, 0, 1);
        let mut located = Vec::new();
        for max_recenter_iterations in [0, 3] {
            let mut params = params()
                .with_smoothing(0.0, 0)
                .with_search_mode(SearchMode::Deep);
            params.max_recenter_iterations = max_recenter_iterations;
            let locator = PeakLocator::new(&source, &MeanSmoother, &params);
            let mut session = DetectionSession::new(params.peak_tolerance);
            let coarse = locator.read_channel(&mut session, &target).unwrap();
            let probe = locator.locate(&mut session, &coarse, 20, &target).unwrap();

            // The envelope spans both the coarse apex and the narrow trace's peak
            let ellipse = *probe.ellipse().unwrap();
            let (t_lo, t_hi) = ellipse.time_bounds();
            assert!(t_lo <= 20.0 && t_hi >= 60.0, "{t_lo} {t_hi}");
            assert!(probe.is_ok(), "{probe:?}");
            assert!((probe.peak().area - 100.0).abs() < 1e-9);
            located.push(probe);
        }
        assert_eq!(located[0], located[1]);
    }

    #[test]
    fn test_ellipse_area_limits() {
        let ellipse = Ellipse::new(1.0, 1.0, 100.0, 0.01);
        let times = vec![0.0, 0.5, 1.0, 1.5, 2.0];
        let points = vec![
            SignalPoint::new(0.0, 100.0, 50.0),
            SignalPoint::new(0.5, 100.0, 10.0),
            SignalPoint::new(1.0, 100.0, 20.0),
            SignalPoint::new(1.0, 100.02, 40.0),
            SignalPoint::new(1.5, 100.005, 10.0),
        ];
        let area = ellipse_area(&points, &times, &ellipse, None);
        assert!((area - 20.0).abs() < 1e-9, "{area}");
        let clipped = ellipse_area(&points, &times, &ellipse, Some((0.7, 2.0)));
        assert!((clipped - 15.0).abs() < 1e-9, "{clipped}");
    }
}
