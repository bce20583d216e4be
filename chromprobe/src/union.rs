/*! Merging split peaks and removing repeated detections.

Peaks are united by recomputing their envelope and integrating the raw signal inside it
again. The areas of the parts are never added together, since the parts overlap.
*/
use tracing::{debug, trace};

use crate::chromatogram::{Chromatogram, Smoother};
use crate::locator::PeakLocator;
use crate::params::DetectionParams;
use crate::peak::{approx_equal, AreaStatus, Ellipse, Peak, Peak3D, PeakTolerance, Probe};
use crate::session::DetectionSession;
use crate::traits::{ChromatogramSource, StoreError};

/// Collapse probes that [`approx_equal`] an earlier probe, keeping the first of each group
pub fn remove_duplicates(probes: Vec<Probe>, tolerance: &PeakTolerance) -> Vec<Probe> {
    let mut kept: Vec<Probe> = Vec::with_capacity(probes.len());
    for probe in probes {
        if kept
            .iter()
            .any(|k| approx_equal(k.peak(), probe.peak(), tolerance))
        {
            trace!("Dropping duplicate peak at {:.3}", probe.peak().apex);
            continue;
        }
        kept.push(probe);
    }
    kept
}

fn apex_value(values: &[f32], trace: &Chromatogram, time: f64) -> Option<(usize, f32)> {
    let i = trace.index_of_time(time)?;
    values.get(i).map(|v| (i, *v))
}

/// Whether the lowest value of `values` between the apexes of `a` and `b` stays at or
/// above `cutoff` times the lower of the two apex values.
fn no_deep_valley(values: &[f32], trace: &Chromatogram, a: &Peak, b: &Peak, cutoff: f32) -> bool {
    let (Some((ia, va)), Some((ib, vb))) = (
        apex_value(values, trace, a.apex),
        apex_value(values, trace, b.apex),
    ) else {
        return false;
    };
    match Chromatogram::min_between(values, ia, ib) {
        Some(low) => low >= cutoff * va.min(vb),
        None => false,
    }
}

/// Unites the parts of split peaks found on one channel's trace.
pub struct PeakUnion<'l, 'a, S: ChromatogramSource + ?Sized, M: Smoother + ?Sized> {
    pub locator: &'l PeakLocator<'a, S, M>,
    pub trace: &'l Chromatogram,
    pub ms_level: u8,
}

impl<'l, 'a, S: ChromatogramSource + ?Sized, M: Smoother + ?Sized> PeakUnion<'l, 'a, S, M> {
    pub fn new(locator: &'l PeakLocator<'a, S, M>, trace: &'l Chromatogram, ms_level: u8) -> Self {
        Self {
            locator,
            trace,
            ms_level,
        }
    }

    fn params(&self) -> &DetectionParams {
        self.locator.params
    }

    /// Two peaks are twins when they are one elution event split in two
    pub fn are_twins(&self, a: &Peak, b: &Peak) -> bool {
        let params = self.params();
        let (side, full) = (
            params.overlap_peak_distance_divisor,
            params.overlap_full_distance_divisor,
        );
        (a.in_inner_region(b.apex, side, full) || b.in_inner_region(a.apex, side, full))
            && (a.mz - b.mz).abs() <= params.twin_mz_tolerance
            && no_deep_valley(
                &self.trace.smoothed,
                self.trace,
                a,
                b,
                params.twin_in_between_cutoff,
            )
    }

    /// Two neighboring peaks may be joined when their time ranges overlap and the raw
    /// signal does not fall into a deep valley between them.
    pub fn are_close(&self, a: &Peak, b: &Peak) -> bool {
        let params = self.params();
        let overlapping = a.lower_valley < b.upper_valley && b.lower_valley < a.upper_valley;
        overlapping
            && (a.mz - b.mz).abs() <= params.twin_mz_tolerance
            && no_deep_valley(
                &self.trace.raw,
                self.trace,
                a,
                b,
                params.union_in_between_cutoff,
            )
    }

    /// Build the peak enveloping both `a` and `b` and integrate the raw signal inside it
    pub fn unite(
        &self,
        session: &mut DetectionSession,
        a: &Probe,
        b: &Probe,
    ) -> Result<Probe, StoreError> {
        let (pa, pb) = (a.peak(), b.peak());
        let dominant = if pb.apex_intensity > pa.apex_intensity {
            pb
        } else {
            pa
        };
        let lower = pa.lower_valley.min(pb.lower_valley);
        let upper = pa.upper_valley.max(pb.upper_valley);
        let lower_mz = pa.lower_mz().min(pb.lower_mz());
        let upper_mz = pa.upper_mz().max(pb.upper_mz());

        // The border samples belong to the valleys, only the samples strictly inside
        // the new envelope are integrated.
        let inner = self.trace.indices_strictly_between(lower, upper);
        let (trace_area, smoothed_area) = if inner.is_empty() {
            (0.0, 0.0)
        } else {
            (
                self.trace.raw_area(inner.start, inner.end - 1),
                self.trace.smoothed_area(inner.start, inner.end - 1),
            )
        };
        let span = self.trace.indices_between(lower, upper);
        let background = match (
            self.trace.raw.get(span.start),
            span.end.checked_sub(1).and_then(|i| self.trace.raw.get(i)),
        ) {
            (Some(x), Some(y)) if !span.is_empty() => (*x as f64 + *y as f64) / 2.0,
            _ => 0.0,
        };

        let mut peak = Peak {
            mz: dominant.mz,
            lower_mz_band: dominant.mz - lower_mz,
            upper_mz_band: upper_mz - dominant.mz,
            lower_valley: lower,
            apex: dominant.apex,
            upper_valley: upper,
            area: trace_area,
            area_error: (trace_area - smoothed_area).abs(),
            background,
            apex_intensity: dominant.apex_intensity,
            charge: dominant.charge,
            isotope: dominant.isotope,
            greedy: pa.greedy || pb.greedy,
            status: AreaStatus::Ok,
        };

        let united = match (a, b) {
            (Probe::Flat(_), Probe::Flat(_)) => Probe::Flat(peak),
            _ => {
                let max_stretch = self.params().max_ellipse_mz_stretch;
                let ellipse = Ellipse::new(
                    (lower + upper) / 2.0,
                    (upper - lower) / 2.0,
                    peak.mz,
                    peak.lower_mz_band
                        .max(peak.upper_mz_band)
                        .min(max_stretch),
                );
                let area =
                    self.locator
                        .integrate_ellipse(session, &ellipse, self.ms_level, None)?;
                peak.area = area;
                peak.area_error = (trace_area - area).abs();
                Probe::Volume(Peak3D {
                    peak,
                    ellipse,
                    overlap: a.overlap().union(&b.overlap()),
                })
            }
        };
        let united = if united.peak().area > 0.0 {
            united
        } else {
            united.with_status(AreaStatus::TooSmall)
        };
        debug!(
            "United peaks at {:.3} and {:.3} into {:.3}-{:.3} with area {:.1}",
            pa.apex,
            pb.apex,
            lower,
            upper,
            united.peak().area
        );
        Ok(united)
    }

    fn merge_pass(
        &self,
        session: &mut DetectionSession,
        mut probes: Vec<(Probe, f64)>,
        mergeable: impl Fn(&Self, &Peak, &Peak) -> bool,
        accept: impl Fn(&Probe, f64) -> bool,
    ) -> Result<Vec<Probe>, StoreError> {
        probes.sort_by(|(a, _), (b, _)| a.peak().apex.total_cmp(&b.peak().apex));
        let mut merged: Vec<(Probe, f64)> = Vec::with_capacity(probes.len());
        for (probe, expected) in probes {
            if let Some((last, last_expected)) = merged.last_mut() {
                if last.is_ok() && probe.is_ok() && mergeable(self, last.peak(), probe.peak()) {
                    let united = self.unite(session, last, &probe)?;
                    let united_expected = *last_expected + expected;
                    if accept(&united, united_expected) {
                        *last = united;
                        *last_expected = united_expected;
                        continue;
                    }
                    debug!(
                        "Keeping peaks at {:.3} and {:.3} apart, their union has area {:.1} against {united_expected:.1}",
                        last.peak().apex,
                        probe.peak().apex,
                        united.peak().area
                    );
                }
            }
            merged.push((probe, expected));
        }
        Ok(merged.into_iter().map(|(probe, _)| probe).collect())
    }

    /// Unite every run of twin peaks, visiting peaks in apex order
    pub fn unite_twins(
        &self,
        session: &mut DetectionSession,
        probes: Vec<Probe>,
    ) -> Result<Vec<Probe>, StoreError> {
        let probes = probes.into_iter().map(|p| (p, 0.0)).collect();
        self.merge_pass(session, probes, Self::are_twins, |_, _| true)
    }

    /// Unite overlapping neighbors not separated by a deep raw valley
    pub fn unite_close(
        &self,
        session: &mut DetectionSession,
        probes: Vec<Probe>,
    ) -> Result<Vec<Probe>, StoreError> {
        let probes = probes.into_iter().map(|p| (p, 0.0)).collect();
        self.merge_pass(session, probes, Self::are_close, |_, _| true)
    }

    /// Like [`PeakUnion::unite_close`], but every probe carries the area it is expected to
    /// have. A union is only kept when `accept` approves its area against the summed
    /// expectation of its parts, otherwise the parts stay separate.
    pub fn unite_close_expected(
        &self,
        session: &mut DetectionSession,
        probes: Vec<(Probe, f64)>,
        accept: impl Fn(&Probe, f64) -> bool,
    ) -> Result<Vec<Probe>, StoreError> {
        self.merge_pass(session, probes, Self::are_close, accept)
    }
}
