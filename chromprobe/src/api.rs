//! High level APIs for detecting the isotopic peaks of an analyte
use std::collections::BTreeMap;

use tracing::{debug, instrument, trace};

use crate::chromatogram::{MeanSmoother, Smoother};
use crate::isotope::{theoretical_area, IsotopeOverlapClassifier};
use crate::locator::{ChannelTarget, PeakLocator};
use crate::params::DetectionParams;
use crate::peak::{approx_equal, AreaStatus, Peak, PeakTolerance, Probe};
use crate::session::DetectionSession;
use crate::traits::{ChromatogramSource, DetectionError, StoreError};
use crate::union::{remove_duplicates, PeakUnion};

/// An analyte to search for, described by its monoisotopic m/z and the relative
/// abundances of its isotopes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AnalyteTarget {
    pub mz: f64,
    pub charge: i32,
    pub ms_level: u8,
    /// The theoretical abundance of each isotope, starting with the monoisotopic peak
    pub abundance_ratios: Vec<f64>,
    /// When given, only the candidate nearest this time is considered
    pub retention_time: Option<f64>,
    /// Peaks of other analytes whose isotopes may bleed into this analyte's channels
    pub possible_peaks: Vec<Peak>,
}

impl Default for AnalyteTarget {
    fn default() -> Self {
        Self {
            mz: 0.0,
            charge: 1,
            ms_level: 1,
            abundance_ratios: vec![1.0],
            retention_time: None,
            possible_peaks: Vec::new(),
        }
    }
}

impl AnalyteTarget {
    pub fn new(mz: f64, charge: i32, abundance_ratios: Vec<f64>) -> Self {
        Self {
            mz,
            charge,
            abundance_ratios,
            ..Default::default()
        }
    }

    pub fn with_retention_time(mut self, retention_time: f64) -> Self {
        self.retention_time = Some(retention_time);
        self
    }

    pub fn with_ms_level(mut self, ms_level: u8) -> Self {
        self.ms_level = ms_level;
        self
    }

    pub fn with_possible_peaks(mut self, possible_peaks: Vec<Peak>) -> Self {
        self.possible_peaks = possible_peaks;
        self
    }

    /// The m/z of isotope channel `isotope`
    pub fn channel_mz(&self, isotope: usize, isotope_spacing: f64) -> f64 {
        self.mz + isotope as f64 * isotope_spacing / self.charge.unsigned_abs().max(1) as f64
    }

    pub fn num_channels(&self) -> usize {
        self.abundance_ratios.len()
    }

    fn channel(&self, isotope: usize, isotope_spacing: f64) -> ChannelTarget {
        ChannelTarget::new(
            self.channel_mz(isotope, isotope_spacing),
            self.charge,
            isotope,
            self.ms_level,
        )
    }

    pub fn validate(&self) -> Result<(), DetectionError> {
        if !(self.mz.is_finite() && self.mz > 0.0) {
            return Err(DetectionError::InvalidTarget(format!(
                "m/z must be positive, got {}",
                self.mz
            )));
        }
        if self.charge == 0 {
            return Err(DetectionError::InvalidTarget(
                "charge must not be zero".to_string(),
            ));
        }
        if self.abundance_ratios.is_empty() {
            return Err(DetectionError::InvalidTarget(
                "at least one abundance ratio is required".to_string(),
            ));
        }
        if self
            .abundance_ratios
            .iter()
            .any(|r| !r.is_finite() || *r < 0.0)
        {
            return Err(DetectionError::InvalidTarget(format!(
                "abundance ratios must be finite and non-negative, got {:?}",
                self.abundance_ratios
            )));
        }
        Ok(())
    }
}

/// The accepted peaks of an analyte, by isotope channel.
///
/// Channels are contiguous from zero: channel `k` is only present when channel `k - 1`
/// is. Candidates that were found and then rejected are kept in `rejected` along with
/// the reason.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsotopicPeakSet {
    pub ms_level: u8,
    pub channels: BTreeMap<usize, Vec<Probe>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub rejected: Vec<Probe>,
}

impl IsotopicPeakSet {
    pub fn new(ms_level: u8) -> Self {
        Self {
            ms_level,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_peaks(&self) -> usize {
        self.channels.values().map(|c| c.len()).sum()
    }

    pub fn get(&self, isotope: usize) -> Option<&[Probe]> {
        self.channels.get(&isotope).map(|c| c.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Probe)> {
        self.channels
            .iter()
            .flat_map(|(k, probes)| probes.iter().map(|p| (*k, p)))
    }

    /// The summed area of every accepted peak in `isotope`
    pub fn channel_area(&self, isotope: usize) -> f64 {
        self.get(isotope)
            .map(|c| c.iter().map(|p| p.peak().area).sum())
            .unwrap_or_default()
    }
}

/// A placeholder for a channel 0 start that falls inside a peak accepted earlier
fn claimed_start(accepted: &[Probe], channel: &ChannelTarget, time: f64) -> Option<Probe> {
    if !accepted.iter().any(|p| p.peak().contains_time(time)) {
        return None;
    }
    let mut used = Peak::empty(channel.mz, channel.charge, 0, AreaStatus::AlreadyUsed);
    used.apex = time;
    Some(Probe::Flat(used))
}

/// Accept a located channel 0 probe unless it failed or repeats an accepted one
fn admit_base_probe(
    accepted: &mut Vec<Probe>,
    rejected: &mut Vec<Probe>,
    probe: Probe,
    tolerance: &PeakTolerance,
) {
    if !probe.is_ok() {
        rejected.push(probe);
    } else if accepted
        .iter()
        .any(|p| approx_equal(p.peak(), probe.peak(), tolerance))
    {
        trace!("Channel 0 peak at {:.3} was already found", probe.peak().apex);
        rejected.push(probe.with_status(AreaStatus::Duplicate));
    } else {
        accepted.push(probe);
    }
}

/// A reusable detector bound to one data source and parameter set.
///
/// Every call builds its own [`DetectionSession`], so a detector may be shared across
/// threads when its source is `Sync`.
#[derive(Debug, Clone)]
pub struct IsotopeDetector<'a, S: ChromatogramSource + ?Sized, M: Smoother = MeanSmoother> {
    pub source: &'a S,
    pub smoother: M,
    pub params: DetectionParams,
}

impl<'a, S: ChromatogramSource + ?Sized> IsotopeDetector<'a, S, MeanSmoother> {
    pub fn new(source: &'a S, params: DetectionParams) -> Self {
        Self {
            source,
            smoother: MeanSmoother,
            params,
        }
    }
}

impl<'a, S: ChromatogramSource + ?Sized, M: Smoother> IsotopeDetector<'a, S, M> {
    pub fn with_smoother<N: Smoother>(self, smoother: N) -> IsotopeDetector<'a, S, N> {
        IsotopeDetector {
            source: self.source,
            smoother,
            params: self.params,
        }
    }

    fn locator(&self) -> PeakLocator<'_, S, M> {
        PeakLocator::new(self.source, &self.smoother, &self.params)
    }

    fn base_channel(
        &self,
        locator: &PeakLocator<'_, S, M>,
        session: &mut DetectionSession,
        target: &AnalyteTarget,
        rejected: &mut Vec<Probe>,
    ) -> Result<Vec<Probe>, DetectionError> {
        let params = &self.params;
        let channel = target.channel(0, params.isotope_spacing);
        let trace0 = locator.read_channel(session, &channel)?;
        if trace0.is_blank() {
            debug!("No signal for {:.4} at MS level {}", channel.mz, channel.ms_level);
            return Ok(Vec::new());
        }

        let threshold = trace0.max_smoothed() * params.min_relative_intensity;
        let mut starts = trace0.local_maxima(threshold);
        if let Some(rt) = target.retention_time {
            starts = starts
                .into_iter()
                .filter(|i| (trace0.times[*i] - rt).abs() <= params.rt_hint_window)
                .min_by(|a, b| {
                    let da = (trace0.times[*a] - rt).abs();
                    let db = (trace0.times[*b] - rt).abs();
                    da.total_cmp(&db)
                })
                .into_iter()
                .collect();
        }
        starts.truncate(params.max_candidates);
        trace!("{} candidates in channel 0", starts.len());

        let mut accepted: Vec<Probe> = Vec::new();
        for start in starts {
            let time = trace0.times[start];
            if let Some(used) = claimed_start(&accepted, &channel, time) {
                rejected.push(used);
                continue;
            }
            let probe = locator.locate(session, &trace0, start, &channel)?;
            admit_base_probe(&mut accepted, rejected, probe, &params.peak_tolerance);
        }

        let union = PeakUnion::new(locator, &trace0, target.ms_level);
        let envelopes = union.unite_twins(session, accepted)?;
        Ok(remove_duplicates(envelopes, &params.peak_tolerance))
    }

    /// Find the peaks of every isotope channel of `target`.
    ///
    /// Channel 0 is searched for candidate peaks, nearest the retention time hint if one is
    /// given. Each accepted channel 0 peak starts an envelope, and every following channel
    /// is searched within that envelope's time borders. An envelope ends at the first
    /// channel where no candidate matches the expected area, or where the best candidate
    /// is explained by a peak already accepted on the preceding channel, its own included,
    /// or by a supplied possible peak. Neighboring peaks of a channel are finally united
    /// when their union still matches the area expected of the envelopes they belong to.
    ///
    /// # Errors
    /// Only an invalid target or a failure of the data source is an error. Signal that
    /// cannot be quantified is reported in [`IsotopicPeakSet::rejected`].
    #[instrument(level = "debug", skip_all, fields(mz = target.mz, charge = target.charge))]
    pub fn detect_isotopic_peaks(
        &self,
        target: &AnalyteTarget,
    ) -> Result<IsotopicPeakSet, DetectionError> {
        target.validate()?;
        let params = &self.params;
        if target.ms_level > 1 {
            self.source.prepare_msn_cache(target.ms_level)?;
        }
        let mut session = DetectionSession::new(params.peak_tolerance);
        let locator = self.locator();
        let classifier = IsotopeOverlapClassifier::from(params);
        let mut result = IsotopicPeakSet::new(target.ms_level);

        let envelopes = self.base_channel(&locator, &mut session, target, &mut result.rejected)?;
        let mut chains: Vec<Vec<Probe>> = envelopes.into_iter().map(|e| vec![e]).collect();
        let mut live: Vec<usize> = (0..chains.len()).collect();
        let ratios = &target.abundance_ratios;

        for k in 1..target.num_channels() {
            if live.is_empty() {
                break;
            }
            let channel = target.channel(k, params.isotope_spacing);
            let trace_k = locator.read_channel(&mut session, &channel)?;
            let maxima = trace_k.local_maxima(trace_k.max_smoothed() * params.min_relative_intensity);
            let previous_mz = target.channel_mz(k - 1, params.isotope_spacing);
            let ratio_previous = if ratios[k] > 0.0 {
                ratios[k - 1] / ratios[k]
            } else {
                f64::INFINITY
            };

            let mut extended = Vec::with_capacity(live.len());
            for &e in live.iter() {
                let reference = chains[e][0].peak().clone();
                let theoretical = theoretical_area(reference.area, ratios[0], ratios[k]);
                let mut candidates = Vec::new();
                for &start in maxima
                    .iter()
                    .filter(|i| reference.contains_time(trace_k.times[**i]))
                    .take(params.max_candidates)
                {
                    let probe = locator.locate(&mut session, &trace_k, start, &channel)?;
                    if probe.is_ok() {
                        candidates.push(probe);
                    } else {
                        result.rejected.push(probe);
                    }
                }
                let candidates = remove_duplicates(candidates, &params.peak_tolerance);

                let Some(best) = classifier.select(&reference, theoretical, &candidates) else {
                    debug!(
                        "Envelope at {:.3} ends at channel {k}, expected area {theoretical:.1}",
                        reference.apex
                    );
                    continue;
                };
                let previous = live
                    .iter()
                    .filter_map(|o| chains[*o].get(k - 1))
                    .map(|p| p.peak())
                    .chain(
                        target
                            .possible_peaks
                            .iter()
                            .filter(|p| params.coarse_tolerance.test(p.mz, previous_mz)),
                    );
                let checked =
                    classifier.check_previous_isotopes(best.clone(), previous, ratio_previous);
                if checked.is_ok() {
                    extended.push((e, checked));
                } else {
                    result.rejected.push(checked);
                }
            }

            live = extended.iter().map(|(e, _)| *e).collect();
            for (e, probe) in extended {
                chains[e].push(probe);
            }
        }

        let mut by_channel: BTreeMap<usize, Vec<(Probe, f64)>> = BTreeMap::new();
        for chain in chains {
            let reference_area = chain[0].peak().area;
            for (k, probe) in chain.into_iter().enumerate() {
                let expected = theoretical_area(reference_area, ratios[0], ratios[k]);
                by_channel.entry(k).or_default().push((probe, expected));
            }
        }
        for (k, probes) in by_channel {
            let channel = target.channel(k, params.isotope_spacing);
            let trace_k = locator.read_channel(&mut session, &channel)?;
            let union = PeakUnion::new(&locator, &trace_k, target.ms_level);
            let probes = if k == 0 {
                union.unite_close(&mut session, probes.into_iter().map(|(p, _)| p).collect())?
            } else {
                union.unite_close_expected(&mut session, probes, |united, expected| {
                    classifier.in_area_window(united.peak().area, expected)
                })?
            };
            let probes = remove_duplicates(probes, &params.peak_tolerance);
            result.channels.insert(k, probes);
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            for k in result.channels.keys() {
                trace!(
                    "Channel {k}: area {:.1} from {} peaks",
                    result.channel_area(*k),
                    result.get(*k).map(|c| c.len()).unwrap_or_default()
                );
            }
        }

        let stats = session.stats();
        debug!(
            "Found {} peaks in {} channels ({} cache hits, {} misses)",
            result.num_peaks(),
            result.num_channels(),
            stats.hits,
            stats.misses
        );
        Ok(result)
    }

    fn clip_probe(
        &self,
        locator: &PeakLocator<'_, S, M>,
        session: &mut DetectionSession,
        probe: &Probe,
        ms_level: u8,
        lower: f64,
        upper: f64,
    ) -> Result<Option<Probe>, StoreError> {
        let peak = probe.peak();
        let lo = peak.lower_valley.max(lower);
        let hi = peak.upper_valley.min(upper);
        if lo >= hi {
            return Ok(None);
        }
        let trace = self
            .source
            .read_chromatogram(peak.lower_mz(), peak.upper_mz(), ms_level)?;
        let span = trace.indices_between(lo, hi);
        if span.is_empty() {
            return Ok(None);
        }
        let (first, last) = (span.start, span.end - 1);
        let inside: Vec<usize> = span
            .filter(|i| trace.times[*i] > lower && trace.times[*i] < upper)
            .collect();
        let trace_area: f64 = inside
            .iter()
            .map(|i| trace.raw[*i] as f64 * trace.sample_width(*i))
            .sum();
        let area = match probe.ellipse() {
            Some(ellipse) => {
                locator.integrate_ellipse(session, ellipse, ms_level, Some((lower, upper)))?
            }
            None => trace_area,
        };
        if area <= 0.0 {
            return Ok(None);
        }
        let Some((apex, apex_intensity)) = trace.raw_apex_between(first, last) else {
            return Ok(None);
        };

        let mut clipped = probe.clone();
        let p = clipped.peak_mut();
        p.lower_valley = lo;
        p.upper_valley = hi;
        p.apex = trace.times[apex];
        p.apex_intensity = apex_intensity;
        p.area = area;
        p.area_error = (trace_area - area).abs();
        p.background = (trace.raw[first] as f64 + trace.raw[last] as f64) / 2.0;
        Ok(Some(clipped))
    }

    /// Re-integrate every peak of `previous` using only signal strictly inside
    /// `lower..upper`, clipping time borders to the limits.
    ///
    /// # Errors
    /// [`DetectionError::EmptyChannel`] if any channel has no peak left with a positive
    /// area inside the limits.
    #[instrument(level = "debug", skip(self, previous))]
    pub fn recalculate_within_hard_limits(
        &self,
        previous: &IsotopicPeakSet,
        lower: f64,
        upper: f64,
    ) -> Result<IsotopicPeakSet, DetectionError> {
        if lower.is_nan() || upper.is_nan() || lower >= upper {
            return Err(StoreError::InvalidWindow {
                low: lower,
                high: upper,
            }
            .into());
        }
        let mut session = DetectionSession::new(self.params.peak_tolerance);
        let locator = self.locator();
        let mut result = IsotopicPeakSet::new(previous.ms_level);
        result.rejected = previous.rejected.clone();

        for (k, probes) in previous.channels.iter() {
            let mut kept = Vec::with_capacity(probes.len());
            for probe in probes {
                match self.clip_probe(
                    &locator,
                    &mut session,
                    probe,
                    previous.ms_level,
                    lower,
                    upper,
                )? {
                    Some(p) => kept.push(p),
                    None => trace!(
                        "Peak at {:.3} in channel {k} has no signal within {lower}-{upper}",
                        probe.peak().apex
                    ),
                }
            }
            if kept.is_empty() {
                return Err(DetectionError::EmptyChannel(*k));
            }
            result.channels.insert(*k, kept);
        }
        Ok(result)
    }
}

/// A single-shot isotopic peak detection for `target`.
///
/// # Arguments
/// - `source`: The raw signal to search
/// - `target`: The analyte's m/z, charge, isotope abundances and optional retention time
/// - `params`: The detection parameters, see [`DetectionParams`]
///
/// # Note
/// When detecting many analytes against the same source, build an [`IsotopeDetector`]
/// once and call its identically named method.
pub fn detect_isotopic_peaks<S: ChromatogramSource + ?Sized>(
    source: &S,
    target: &AnalyteTarget,
    params: DetectionParams,
) -> Result<IsotopicPeakSet, DetectionError> {
    IsotopeDetector::new(source, params).detect_isotopic_peaks(target)
}

/// Re-integrate a previous detection strictly inside `lower..upper`.
///
/// See [`IsotopeDetector::recalculate_within_hard_limits`].
pub fn recalculate_within_hard_limits<S: ChromatogramSource + ?Sized>(
    source: &S,
    previous: &IsotopicPeakSet,
    lower: f64,
    upper: f64,
    params: DetectionParams,
) -> Result<IsotopicPeakSet, DetectionError> {
    IsotopeDetector::new(source, params).recalculate_within_hard_limits(previous, lower, upper)
}
