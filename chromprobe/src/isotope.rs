//! Deciding whether a peak in a higher isotope channel belongs to that channel
use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::params::DetectionParams;
use crate::peak::{AreaStatus, Peak, Probe};

/// The area a channel's peak is expected to have given the reference channel's area
pub fn theoretical_area(reference_area: f64, reference_ratio: f64, ratio: f64) -> f64 {
    let reference_ratio = if reference_ratio > 0.0 {
        reference_ratio
    } else {
        1.0
    };
    reference_area * ratio / reference_ratio
}

/// Scores and filters isotope channel candidates against their reference peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsotopeOverlapClassifier {
    /// The acceptance window is `[T / lower_divisor, T * upper_factor]`
    pub lower_divisor: f64,
    pub upper_factor: f64,
    pub border_match_divisor: f64,
    pub loose_border_divisor: f64,
    pub previous_iso_area_factor: f64,
    pub overlap_peak_distance_divisor: f64,
    pub overlap_full_distance_divisor: f64,
}

impl From<&DetectionParams> for IsotopeOverlapClassifier {
    fn from(params: &DetectionParams) -> Self {
        let (lower_divisor, upper_factor) = params.isotope_area_window();
        Self {
            lower_divisor,
            upper_factor,
            border_match_divisor: params.border_match_divisor,
            loose_border_divisor: params.loose_border_divisor,
            previous_iso_area_factor: params.previous_iso_area_factor,
            overlap_peak_distance_divisor: params.overlap_peak_distance_divisor,
            overlap_full_distance_divisor: params.overlap_full_distance_divisor,
        }
    }
}

impl Default for IsotopeOverlapClassifier {
    fn default() -> Self {
        Self::from(&DetectionParams::default())
    }
}

impl IsotopeOverlapClassifier {
    pub fn area_window(&self, theoretical: f64) -> (f64, f64) {
        (theoretical / self.lower_divisor, theoretical * self.upper_factor)
    }

    pub fn in_area_window(&self, area: f64, theoretical: f64) -> bool {
        let (lo, hi) = self.area_window(theoretical);
        area >= lo && area <= hi
    }

    /// How well `candidate` lines up in time with the reference peak
    pub fn match_score(&self, reference: &Peak, candidate: &Peak) -> u32 {
        let width = reference.width();
        let tight = width / self.border_match_divisor;
        let loose = width / self.loose_border_divisor;
        let border_score = |a: f64, b: f64| {
            let d = (a - b).abs();
            if d <= tight {
                2
            } else if d <= loose {
                1
            } else {
                0
            }
        };
        let mut score = 0;
        if (candidate.apex - reference.apex).abs() <= tight {
            score += 3;
        }
        score += border_score(candidate.lower_valley, reference.lower_valley);
        score += border_score(candidate.upper_valley, reference.upper_valley);
        score
    }

    /// Pick the candidate that best explains channel `candidates[..].isotope` given its
    /// reference peak, or `None` if no quantified candidate falls in the area window.
    pub fn select<'p>(
        &self,
        reference: &Peak,
        theoretical: f64,
        candidates: &'p [Probe],
    ) -> Option<&'p Probe> {
        candidates
            .iter()
            .filter(|c| c.is_ok())
            .filter(|c| {
                let ok = self.in_area_window(c.peak().area, theoretical);
                if !ok {
                    trace!(
                        "Rejecting candidate at {:.3} with area {:.1} outside of {:?}",
                        c.peak().apex,
                        c.peak().area,
                        self.area_window(theoretical)
                    );
                }
                ok
            })
            .map(|c| (self.match_score(reference, c.peak()), c))
            .max_by(|(sa, a), (sb, b)| {
                sa.cmp(sb).then_with(|| {
                    let da = (a.peak().area - theoretical).abs();
                    let db = (b.peak().area - theoretical).abs();
                    db.partial_cmp(&da).unwrap_or(Ordering::Equal)
                })
            })
            .map(|(_, c)| c)
    }

    /// Whether `candidate` is better explained as the tail of `previous`, a peak of the
    /// preceding isotope channel, given `ratio = ratio_previous / ratio_candidate`.
    pub fn is_from_previous_isotope(&self, candidate: &Peak, previous: &Peak, ratio: f64) -> bool {
        previous.is_ok()
            && previous.area > candidate.area * ratio * self.previous_iso_area_factor
            && previous.in_inner_region(
                candidate.apex,
                self.overlap_peak_distance_divisor,
                self.overlap_full_distance_divisor,
            )
    }

    /// Mark `candidate` as [`AreaStatus::OtherIso`] if any of `previous` explains it
    pub fn check_previous_isotopes<'a, I: IntoIterator<Item = &'a Peak>>(
        &self,
        candidate: Probe,
        previous: I,
        ratio: f64,
    ) -> Probe {
        let explained_by = previous
            .into_iter()
            .find(|p| self.is_from_previous_isotope(candidate.peak(), p, ratio));
        match explained_by {
            Some(prev) => {
                debug!(
                    "Peak at {:.3} in channel {} is the isotope of a peak at {:.3}",
                    candidate.peak().apex,
                    candidate.peak().isotope,
                    prev.apex
                );
                candidate.with_status(AreaStatus::OtherIso)
            }
            None => candidate,
        }
    }
}
