/*! Locate the borders of a chromatographic peak on a smoothed intensity trace.

Four strategies are supported, all walking outward from a presumed apex:

- [`BorderStrategy::Standard`] stops at the first local minimum
- [`BorderStrategy::Enhanced`] additionally truncates a disproportionately long tail
- [`BorderStrategy::Greedy`] stops where the descent suddenly becomes much less steep,
  extrapolating the steep flank down to zero
- [`BorderStrategy::GreedyWithSteepnessPoint`] is `Greedy` but also records where the
  steepness changed so the caller may fall back to the valley if the shoulder is small
*/
use std::fmt::Display;

use tracing::trace;

use crate::chromatogram::Chromatogram;
use crate::params::DetectionParams;
use crate::peak::{AreaStatus, Peak};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BorderStrategy {
    #[default]
    Standard,
    Enhanced,
    Greedy,
    GreedyWithSteepnessPoint,
}

impl BorderStrategy {
    const fn index(self) -> usize {
        match self {
            BorderStrategy::Standard => 0,
            BorderStrategy::Enhanced => 1,
            BorderStrategy::Greedy => 2,
            BorderStrategy::GreedyWithSteepnessPoint => 3,
        }
    }
}

impl Display for BorderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Lower,
    Upper,
}

impl Side {
    #[inline]
    fn step(self, i: usize, n: usize) -> Option<usize> {
        match self {
            Side::Lower => i.checked_sub(1),
            Side::Upper => {
                if i + 1 < n {
                    Some(i + 1)
                } else {
                    None
                }
            }
        }
    }

    #[inline]
    fn advance(self, i: usize, steps: usize, limit: usize) -> usize {
        match self {
            Side::Lower => i.saturating_sub(steps).max(limit),
            Side::Upper => (i + steps).min(limit),
        }
    }
}

/// Where the border search stopped on one side of the apex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Border {
    pub index: usize,
    /// The border sits in a true valley rather than against neighboring signal
    pub hard: bool,
    /// The border was placed by steepness reduction
    pub greedy: bool,
    pub steepness_point: Option<usize>,
    /// Where a plain valley search stopped on this side
    pub valley: usize,
    pub valley_hard: bool,
}

impl Border {
    fn from_valley(valley: usize, hard: bool) -> Self {
        Self {
            index: valley,
            hard,
            greedy: false,
            steepness_point: None,
            valley,
            valley_hard: hard,
        }
    }

    fn revert_to_valley(&mut self) {
        self.index = self.valley;
        self.hard = self.valley_hard;
        self.greedy = false;
    }
}

/// The borders of a peak on both sides of its apex, as trace indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Borders {
    pub apex: usize,
    pub lower: Border,
    pub upper: Border,
}

impl Borders {
    pub fn greedy(&self) -> bool {
        self.lower.greedy || self.upper.greedy
    }

    pub fn num_samples(&self) -> usize {
        self.upper.index - self.lower.index + 1
    }
}

type BorderFn = fn(&ValleyDetector, &[f32], usize) -> (Border, Border);

const STRATEGIES: [BorderFn; 4] = [
    ValleyDetector::standard_borders,
    ValleyDetector::enhanced_borders,
    ValleyDetector::greedy_borders,
    ValleyDetector::greedy_borders_with_steepness,
];

/// Peak border detection on one dimensional smoothed traces.
///
/// The detector is stateless beyond its thresholds, so every method is a pure
/// function of the trace and the start index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValleyDetector {
    pub greedy_steepness_factor: f64,
    pub greedy_upper_cutoff: f32,
    pub greedy_lower_cutoff: f32,
    pub shoulder_width_divisor: f64,
    pub enhanced_asymmetry_factor: f64,
    pub enhanced_tail_cutoff: f32,
    pub hard_border_fraction: f32,
}

impl Default for ValleyDetector {
    fn default() -> Self {
        Self::from(&DetectionParams::default())
    }
}

impl From<&DetectionParams> for ValleyDetector {
    fn from(params: &DetectionParams) -> Self {
        Self {
            greedy_steepness_factor: params.greedy_steepness_factor,
            greedy_upper_cutoff: params.greedy_upper_cutoff,
            greedy_lower_cutoff: params.greedy_lower_cutoff,
            shoulder_width_divisor: params.shoulder_width_divisor,
            enhanced_asymmetry_factor: params.enhanced_asymmetry_factor,
            enhanced_tail_cutoff: params.enhanced_tail_cutoff,
            hard_border_fraction: params.hard_border_fraction,
        }
    }
}

impl ValleyDetector {
    /// Move from `start` uphill on the smoothed trace until reaching a local maximum
    pub fn climb(&self, smoothed: &[f32], start: usize) -> usize {
        let n = smoothed.len();
        let mut i = start.min(n.saturating_sub(1));
        loop {
            let left = i.checked_sub(1).filter(|j| smoothed[*j] > smoothed[i]);
            let right = Some(i + 1).filter(|j| *j < n && smoothed[*j] > smoothed[i]);
            i = match (left, right) {
                (Some(l), Some(r)) => {
                    if smoothed[r] >= smoothed[l] {
                        r
                    } else {
                        l
                    }
                }
                (Some(l), None) => l,
                (None, Some(r)) => r,
                (None, None) => return i,
            };
        }
    }

    fn is_hard(&self, smoothed: &[f32], index: usize, apex: usize) -> bool {
        smoothed[index] <= smoothed[apex] * self.hard_border_fraction
    }

    fn valley_side(&self, smoothed: &[f32], apex: usize, side: Side) -> usize {
        let mut i = apex;
        while let Some(j) = side.step(i, smoothed.len()) {
            if smoothed[i] <= 0.0 || smoothed[j] > smoothed[i] {
                break;
            }
            i = j;
        }
        i
    }

    fn valley_border(&self, smoothed: &[f32], apex: usize, side: Side) -> Border {
        let valley = self.valley_side(smoothed, apex, side);
        Border::from_valley(valley, self.is_hard(smoothed, valley, apex))
    }

    fn standard_borders(&self, smoothed: &[f32], apex: usize) -> (Border, Border) {
        (
            self.valley_border(smoothed, apex, Side::Lower),
            self.valley_border(smoothed, apex, Side::Upper),
        )
    }

    fn truncate_tail(&self, smoothed: &[f32], apex: usize, border: &mut Border, side: Side) {
        let cutoff = smoothed[apex] * self.enhanced_tail_cutoff;
        let mut i = apex;
        while i != border.index {
            if smoothed[i] < cutoff {
                border.index = i;
                border.hard = self.is_hard(smoothed, i, apex);
                return;
            }
            match side.step(i, smoothed.len()) {
                Some(j) => i = j,
                None => return,
            }
        }
    }

    fn enhanced_borders(&self, smoothed: &[f32], apex: usize) -> (Border, Border) {
        let (mut lower, mut upper) = self.standard_borders(smoothed, apex);
        let lower_len = (apex - lower.index).max(1) as f64;
        let upper_len = (upper.index - apex).max(1) as f64;
        if upper_len > lower_len * self.enhanced_asymmetry_factor {
            self.truncate_tail(smoothed, apex, &mut upper, Side::Upper);
        } else if lower_len > upper_len * self.enhanced_asymmetry_factor {
            self.truncate_tail(smoothed, apex, &mut lower, Side::Lower);
        }
        (lower, upper)
    }

    fn greedy_side(&self, smoothed: &[f32], apex: usize, side: Side) -> Border {
        let valley = self.valley_side(smoothed, apex, side);
        let valley_hard = self.is_hard(smoothed, valley, apex);
        let top = smoothed[apex];
        let upper_cutoff = top * self.greedy_upper_cutoff;
        let lower_cutoff = top * self.greedy_lower_cutoff;

        let mut previous_diff = 0.0f64;
        let mut i = apex;
        while i != valley {
            let Some(j) = side.step(i, smoothed.len()) else {
                break;
            };
            let diff = (smoothed[i] - smoothed[j]) as f64;
            let level = smoothed[i];
            if previous_diff > 0.0
                && level <= upper_cutoff
                && level >= lower_cutoff
                && (diff <= 0.0 || previous_diff / diff > self.greedy_steepness_factor)
            {
                let steps = (level as f64 / previous_diff).ceil() as usize;
                let index = side.advance(i, steps, valley);
                trace!(
                    "Steepness changed at {i} ({previous_diff:.1} -> {diff:.1}), border extrapolated to {index}"
                );
                return Border {
                    index,
                    hard: index == valley && valley_hard,
                    greedy: true,
                    steepness_point: Some(i),
                    valley,
                    valley_hard,
                };
            }
            previous_diff = diff;
            i = j;
        }
        Border::from_valley(valley, valley_hard)
    }

    fn greedy_borders_with_steepness(&self, smoothed: &[f32], apex: usize) -> (Border, Border) {
        (
            self.greedy_side(smoothed, apex, Side::Lower),
            self.greedy_side(smoothed, apex, Side::Upper),
        )
    }

    fn greedy_borders(&self, smoothed: &[f32], apex: usize) -> (Border, Border) {
        let (mut lower, mut upper) = self.greedy_borders_with_steepness(smoothed, apex);
        lower.steepness_point = None;
        upper.steepness_point = None;
        (lower, upper)
    }

    /// Find the borders of the peak containing `start` using `strategy`.
    ///
    /// Returns `None` when `start` is outside the trace or there is no signal at the
    /// local maximum reached from it.
    pub fn find_borders(
        &self,
        smoothed: &[f32],
        start: usize,
        strategy: BorderStrategy,
    ) -> Option<Borders> {
        if start >= smoothed.len() {
            return None;
        }
        let apex = self.climb(smoothed, start);
        if smoothed[apex] <= 0.0 {
            return None;
        }
        let (lower, upper) = STRATEGIES[strategy.index()](self, smoothed, apex);
        Some(Borders { apex, lower, upper })
    }

    /// Replace greedy borders by their valleys unless the shoulder they cut off is
    /// wider than the greedy peak's width divided by `shoulder_width_divisor`.
    pub fn resolve_shoulders(&self, times: &[f64], mut borders: Borders) -> Borders {
        let width = times[borders.upper.index] - times[borders.lower.index];
        let min_shoulder = width / self.shoulder_width_divisor;
        for border in [&mut borders.lower, &mut borders.upper] {
            if border.greedy && border.steepness_point.is_some() {
                let shoulder = (times[border.valley] - times[border.index]).abs();
                if shoulder <= min_shoulder {
                    border.revert_to_valley();
                }
            }
        }
        borders
    }

    /// Build a quantified [`Peak`] from previously found borders
    pub fn peak_from_borders(&self, chrom: &Chromatogram, borders: &Borders) -> Peak {
        let mz = chrom.mz();
        let lower = borders.lower.index;
        let upper = borders.upper.index;
        let apex = borders.apex;
        let area = chrom.raw_area(lower, upper);
        let status = if borders.num_samples() < 2 {
            AreaStatus::TooSmall
        } else {
            AreaStatus::Ok
        };
        Peak {
            mz,
            lower_mz_band: mz - chrom.mz_low,
            upper_mz_band: chrom.mz_high - mz,
            lower_valley: chrom.times[lower],
            apex: chrom.times[apex],
            upper_valley: chrom.times[upper],
            area,
            area_error: (area - chrom.smoothed_area(lower, upper)).abs(),
            background: (chrom.raw[lower] as f64 + chrom.raw[upper] as f64) / 2.0,
            apex_intensity: chrom.raw[apex],
            charge: 0,
            isotope: 0,
            greedy: borders.greedy(),
            status,
        }
    }

    /// Detect the peak around `start` and also return the borders it was built from
    pub fn detect_with_borders(
        &self,
        chrom: &Chromatogram,
        start: usize,
        strategy: BorderStrategy,
    ) -> (Peak, Option<Borders>) {
        match self.find_borders(&chrom.smoothed, start, strategy) {
            Some(borders) => (self.peak_from_borders(chrom, &borders), Some(borders)),
            None => (
                Peak::empty(chrom.mz(), 0, 0, AreaStatus::NothingThere),
                None,
            ),
        }
    }

    /// Detect the peak around `start` on the smoothed trace of `chrom`
    pub fn detect(&self, chrom: &Chromatogram, start: usize, strategy: BorderStrategy) -> Peak {
        self.detect_with_borders(chrom, start, strategy).0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chromatogram::MeanSmoother;

    fn gaussian(n: usize, components: &[(f64, f64, f64)]) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                components
                    .iter()
                    .map(|(center, amp, sigma)| {
                        amp * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp()
                    })
                    .sum::<f64>() as f32
            })
            .collect()
    }

    #[test_log::test]
    fn test_single_gaussian_standard() {
        let mut chrom = Chromatogram::from_intensities(500.0, gaussian(101, &[(50.0, 10000.0, 5.0)]));
        chrom.smooth(&MeanSmoother, 3.0, 2);
        let detector = ValleyDetector::default();
        let peak = detector.detect(&chrom, 47, BorderStrategy::Standard);
        assert_eq!(peak.status, AreaStatus::Ok);
        assert!((peak.apex - 50.0).abs() <= 1.0, "apex {}", peak.apex);
        let expected = 10000.0 * 5.0 * (2.0 * std::f64::consts::PI).sqrt();
        assert!(
            ((peak.area - expected) / expected).abs() < 0.02,
            "{} vs {expected}",
            peak.area
        );
        assert!(peak.lower_valley <= peak.apex && peak.apex <= peak.upper_valley);
        assert!(!peak.greedy);
    }

    #[test]
    fn test_valley_between_peaks() {
        let chrom = Chromatogram::from_intensities(
            500.0,
            gaussian(131, &[(50.0, 10000.0, 3.0), (80.0, 6000.0, 3.0)]),
        );
        let detector = ValleyDetector::default();
        let borders = detector
            .find_borders(&chrom.smoothed, 50, BorderStrategy::Standard)
            .unwrap();
        assert_eq!(borders.apex, 50);
        assert!(borders.upper.index > 60 && borders.upper.index < 70);
        assert!(borders.upper.hard);

        let borders = detector
            .find_borders(&chrom.smoothed, 75, BorderStrategy::Standard)
            .unwrap();
        assert_eq!(borders.apex, 80);
        assert!(borders.lower.index > 60 && borders.lower.index < 70);
    }

    #[test]
    fn test_greedy_shoulder() {
        let chrom = Chromatogram::from_intensities(
            500.0,
            gaussian(101, &[(50.0, 10000.0, 2.0), (56.0, 3000.0, 4.0)]),
        );
        let detector = ValleyDetector::default();
        let standard = detector
            .find_borders(&chrom.smoothed, 50, BorderStrategy::Standard)
            .unwrap();
        let greedy = detector
            .find_borders(&chrom.smoothed, 50, BorderStrategy::GreedyWithSteepnessPoint)
            .unwrap();
        assert!(greedy.upper.greedy);
        assert!(!greedy.upper.hard);
        assert!(greedy.upper.index < standard.upper.index);
        assert!((55..=60).contains(&greedy.upper.index), "{:?}", greedy.upper);
        assert!(greedy.upper.steepness_point.is_some());

        let plain = detector
            .find_borders(&chrom.smoothed, 50, BorderStrategy::Greedy)
            .unwrap();
        assert_eq!(plain.upper.index, greedy.upper.index);
        assert!(plain.upper.steepness_point.is_none());

        // The cut-off shoulder is much wider than a third of the greedy peak
        let resolved = detector.resolve_shoulders(&chrom.times, greedy);
        assert_eq!(resolved.upper.index, greedy.upper.index);
        assert!(resolved.upper.greedy);
    }

    #[test]
    fn test_resolve_small_shoulder() {
        let detector = ValleyDetector::default();
        let times: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let borders = Borders {
            apex: 20,
            lower: Border::from_valley(10, true),
            upper: Border {
                index: 28,
                hard: false,
                greedy: true,
                steepness_point: Some(25),
                valley: 30,
                valley_hard: true,
            },
        };
        let resolved = detector.resolve_shoulders(&times, borders);
        assert_eq!(resolved.upper.index, 30);
        assert!(resolved.upper.hard);
        assert!(!resolved.greedy());
    }

    #[test]
    fn test_enhanced_truncates_tail() {
        // A sharp front followed by a long, slowly decaying tail
        let values: Vec<f32> = (0..120)
            .map(|i| {
                if i < 20 {
                    0.0
                } else if i < 25 {
                    (i - 19) as f32 * 2000.0
                } else {
                    10000.0 * (-(i as f32 - 25.0) / 12.0).exp()
                }
            })
            .collect();
        let chrom = Chromatogram::from_intensities(500.0, values);
        let detector = ValleyDetector::default();
        let standard = detector
            .find_borders(&chrom.smoothed, 25, BorderStrategy::Standard)
            .unwrap();
        let enhanced = detector
            .find_borders(&chrom.smoothed, 25, BorderStrategy::Enhanced)
            .unwrap();
        assert_eq!(enhanced.lower.index, standard.lower.index);
        assert!(enhanced.upper.index < standard.upper.index);
        assert!(chrom.smoothed[enhanced.upper.index] < 10000.0 * 0.05);
    }

    #[test]
    fn test_degenerate_traces() {
        let detector = ValleyDetector::default();
        let chrom = Chromatogram::from_intensities(500.0, vec![0.0; 10]);
        assert_eq!(
            detector.detect(&chrom, 5, BorderStrategy::Standard).status,
            AreaStatus::NothingThere
        );
        let chrom = Chromatogram::from_intensities(500.0, vec![0.0, 0.0, 5.0, 0.0, 0.0]);
        assert_eq!(
            detector.detect(&chrom, 12, BorderStrategy::Standard).status,
            AreaStatus::NothingThere
        );
        let peak = detector.detect(&chrom, 1, BorderStrategy::Standard);
        assert_eq!(peak.status, AreaStatus::Ok);
        assert_eq!(peak.apex, 2.0);
        let chrom = Chromatogram::from_intensities(500.0, vec![5.0]);
        assert_eq!(
            detector.detect(&chrom, 0, BorderStrategy::Standard).status,
            AreaStatus::TooSmall
        );
    }

    #[test]
    fn test_border_ordering() {
        let detector = ValleyDetector::default();
        let mut state: u64 = 7;
        let values: Vec<f32> = (0..200)
            .map(|i| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let noise = ((state >> 33) % 500) as f32;
                let x = i as f32;
                noise + 8000.0 * (-(x - 70.0).powi(2) / 50.0).exp()
                    + 5000.0 * (-(x - 130.0).powi(2) / 120.0).exp()
            })
            .collect();
        let mut chrom = Chromatogram::from_intensities(500.0, values);
        chrom.smooth(&MeanSmoother, 4.0, 3);
        for strategy in [
            BorderStrategy::Standard,
            BorderStrategy::Enhanced,
            BorderStrategy::Greedy,
            BorderStrategy::GreedyWithSteepnessPoint,
        ] {
            for start in (0..200).step_by(7) {
                let first = detector.detect(&chrom, start, strategy);
                let second = detector.detect(&chrom, start, strategy);
                assert_eq!(first, second);
                if first.is_ok() {
                    assert!(
                        first.lower_valley <= first.apex && first.apex <= first.upper_valley,
                        "{strategy} {start} {first:?}"
                    );
                }
            }
        }
    }
}
