//! Tunable parameters for peak location, isotope classification and peak union
use std::fmt::Display;

use mzpeaks::Tolerance;

use crate::peak::PeakTolerance;
use crate::valley::BorderStrategy;

/// The mass difference between ¹³C and ¹²C
pub const ISOTOPE_SPACING: f64 = 1.0033548;

/// How aggressively peak borders are placed when searching isotope channels
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SearchMode {
    /// Steepness-reduction borders with a wide isotope acceptance window
    #[default]
    Greedy,
    /// Valley borders only, with a narrower isotope acceptance window
    Deep,
}

impl Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Every empirical constant used during detection.
///
/// Times are in the units of the data source, m/z values in Th.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DetectionParams {
    /// The m/z window of the coarse chromatogram each candidate is searched in
    pub coarse_tolerance: Tolerance,
    /// The m/z window of the small chromatogram read around the resolved profile center
    pub small_chrom_tolerance: Tolerance,
    pub chrom_smooth_range: f64,
    pub chrom_smooth_repeats: u32,

    /// Half width of the m/z window read for the m/z profile
    pub profile_mz_tolerance: f64,
    pub profile_smooth_range: f64,
    pub profile_smooth_repeats: u32,
    /// How far the profile peak center may lie from the theoretical m/z
    pub profile_mz_acceptance: f64,
    /// The narrowest profile peak accepted
    pub min_profile_mz_range: f64,

    /// Candidates below this fraction of the trace's highest smoothed intensity are
    /// rejected before any refinement
    pub min_relative_intensity: f32,
    pub max_candidates: usize,
    /// How far from a retention time hint a candidate apex may be
    pub rt_hint_window: f64,
    pub max_recenter_iterations: usize,
    /// The ellipse's time stretch is capped at this multiple of the coarse half width
    pub max_ellipse_time_factor: f64,
    pub max_ellipse_mz_stretch: f64,

    pub greedy_steepness_factor: f64,
    pub greedy_upper_cutoff: f32,
    pub greedy_lower_cutoff: f32,
    /// A greedy border is kept only when the shoulder beyond it is wider than the
    /// greedy peak's width divided by this
    pub shoulder_width_divisor: f64,
    pub enhanced_asymmetry_factor: f64,
    pub enhanced_tail_cutoff: f32,
    /// A border at or below this fraction of the apex intensity is a true valley
    pub hard_border_fraction: f32,
    /// The border strategy used for the isotope-0 channel search in
    /// [`SearchMode::Deep`]
    pub deep_strategy: BorderStrategy,
    pub search_mode: SearchMode,

    pub isotope_spacing: f64,
    pub iso_in_between_area_factor: f64,
    pub iso_upper_area_factor: f64,
    pub iso_deep_lower_divisor: f64,
    pub iso_deep_upper_factor: f64,
    pub previous_iso_area_factor: f64,
    pub overlap_peak_distance_divisor: f64,
    pub overlap_full_distance_divisor: f64,
    /// Border agreement within the reference width divided by this scores highest
    pub border_match_divisor: f64,
    /// Border agreement within the reference width divided by this scores partially
    pub loose_border_divisor: f64,

    pub twin_in_between_cutoff: f32,
    pub union_in_between_cutoff: f32,
    pub twin_mz_tolerance: f64,
    pub peak_tolerance: PeakTolerance,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            coarse_tolerance: Tolerance::PPM(20.0),
            small_chrom_tolerance: Tolerance::PPM(5.0),
            chrom_smooth_range: 0.5,
            chrom_smooth_repeats: 5,

            profile_mz_tolerance: 0.02,
            profile_smooth_range: 0.002,
            profile_smooth_repeats: 3,
            profile_mz_acceptance: 0.01,
            min_profile_mz_range: 0.0005,

            min_relative_intensity: 0.05,
            max_candidates: 10,
            rt_hint_window: 1.0,
            max_recenter_iterations: 5,
            max_ellipse_time_factor: 2.0,
            max_ellipse_mz_stretch: 0.05,

            greedy_steepness_factor: 2.0,
            greedy_upper_cutoff: 0.6,
            greedy_lower_cutoff: 0.05,
            shoulder_width_divisor: 3.0,
            enhanced_asymmetry_factor: 2.5,
            enhanced_tail_cutoff: 0.05,
            hard_border_fraction: 0.1,
            deep_strategy: BorderStrategy::Enhanced,
            search_mode: SearchMode::Greedy,

            isotope_spacing: ISOTOPE_SPACING,
            iso_in_between_area_factor: 3.0,
            iso_upper_area_factor: 2.0,
            iso_deep_lower_divisor: 2.0,
            iso_deep_upper_factor: 1.5,
            previous_iso_area_factor: 1.5,
            overlap_peak_distance_divisor: 3.0,
            overlap_full_distance_divisor: 6.0,
            border_match_divisor: 6.0,
            loose_border_divisor: 3.0,

            twin_in_between_cutoff: 0.95,
            union_in_between_cutoff: 0.5,
            twin_mz_tolerance: 0.005,
            peak_tolerance: PeakTolerance::default(),
        }
    }
}

impl DetectionParams {
    /// The border strategy used to place time borders in the current search mode
    pub fn border_strategy(&self) -> BorderStrategy {
        match self.search_mode {
            SearchMode::Greedy => BorderStrategy::GreedyWithSteepnessPoint,
            SearchMode::Deep => self.deep_strategy,
        }
    }

    /// The multiplicative window `(lower divisor, upper factor)` around a theoretical
    /// isotope area in the current search mode
    pub fn isotope_area_window(&self) -> (f64, f64) {
        match self.search_mode {
            SearchMode::Greedy => (self.iso_in_between_area_factor, self.iso_upper_area_factor),
            SearchMode::Deep => (self.iso_deep_lower_divisor, self.iso_deep_upper_factor),
        }
    }

    pub fn with_search_mode(mut self, search_mode: SearchMode) -> Self {
        self.search_mode = search_mode;
        self
    }

    pub fn with_smoothing(mut self, range: f64, repeats: u32) -> Self {
        self.chrom_smooth_range = range;
        self.chrom_smooth_repeats = repeats;
        self
    }
}
