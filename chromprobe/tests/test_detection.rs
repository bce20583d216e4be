use rayon::prelude::*;

use chromprobe::params::ISOTOPE_SPACING;
use chromprobe::{
    AnalyteTarget, AreaStatus, ChromatogramSource, DetectionError, DetectionParams,
    IsotopeDetector, ScanStore, SearchMode,
};

const DT: f64 = 0.05;

struct Feature {
    mz: f64,
    apex_scan: f64,
    amplitude: f64,
    sigma: f64,
}

fn feature(mz: f64, apex_scan: f64, amplitude: f64, sigma: f64) -> Feature {
    Feature {
        mz,
        apex_scan,
        amplitude,
        sigma,
    }
}

fn build_store(features: &[Feature], n_scans: usize) -> ScanStore {
    let mut store = ScanStore::default();
    for scan in 0..n_scans {
        let mut mzs = Vec::new();
        let mut intensities = Vec::new();
        for f in features {
            let dt = (scan as f64 - f.apex_scan) / f.sigma;
            let height = f.amplitude * (-dt * dt / 2.0).exp();
            for k in -4i32..=4 {
                let offset = k as f64 * 0.0005;
                let inten = height * (-(offset * offset) / 2e-6).exp();
                if inten >= 0.5 {
                    mzs.push(f.mz + offset);
                    intensities.push(inten as f32);
                }
            }
        }
        store.push_scan(1, scan as u32 + 1, scan as f64 * DT, mzs, intensities);
    }
    store
}

fn params() -> DetectionParams {
    DetectionParams::default().with_smoothing(0.2, 3)
}

fn envelope(mz: f64, charge: i32, apex_scan: f64, amplitudes: &[f64]) -> Vec<Feature> {
    amplitudes
        .iter()
        .enumerate()
        .map(|(k, a)| {
            feature(
                mz + k as f64 * ISOTOPE_SPACING / charge as f64,
                apex_scan,
                *a,
                5.0,
            )
        })
        .collect()
}

#[test_log::test]
fn test_repeated_and_parallel_runs_agree() {
    let mut features = envelope(500.0, 1, 40.0, &[10000.0, 6000.0, 2000.0]);
    features.extend(envelope(720.3, 2, 90.0, &[8000.0, 7000.0, 3500.0]));
    features.extend(envelope(810.1, 3, 60.0, &[5000.0, 4500.0]));
    let store = build_store(&features, 141);
    let detector = IsotopeDetector::new(&store, params());

    let targets = vec![
        AnalyteTarget::new(500.0, 1, vec![1.0, 0.6, 0.2]),
        AnalyteTarget::new(720.3, 2, vec![1.0, 0.85, 0.45, 0.1]),
        AnalyteTarget::new(810.1, 3, vec![1.0, 0.9]).with_retention_time(3.0),
    ];

    let first: Vec<_> = targets
        .iter()
        .map(|t| detector.detect_isotopic_peaks(t).unwrap())
        .collect();
    let second: Vec<_> = targets
        .iter()
        .map(|t| detector.detect_isotopic_peaks(t).unwrap())
        .collect();
    assert_eq!(first, second);

    let parallel: Vec<_> = targets
        .par_iter()
        .map(|t| detector.detect_isotopic_peaks(t))
        .collect::<Result<_, DetectionError>>()
        .unwrap();
    assert_eq!(first, parallel);

    assert_eq!(first[0].num_channels(), 3);
    assert_eq!(first[2].num_channels(), 2);
    for result in first.iter() {
        for (k, probe) in result.iter() {
            let peak = probe.peak();
            assert_eq!(peak.isotope, k);
            assert!(peak.lower_valley <= peak.apex && peak.apex <= peak.upper_valley);
            assert!(peak.area > 0.0);
        }
    }
}

#[test]
fn test_channels_are_contiguous() {
    // Signal in channels 0 and 2 only
    let features = vec![
        feature(640.0, 50.0, 10000.0, 5.0),
        feature(640.0 + 2.0 * ISOTOPE_SPACING, 50.0, 3000.0, 5.0),
    ];
    let store = build_store(&features, 101);
    let detector = IsotopeDetector::new(&store, params());
    let result = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(640.0, 1, vec![1.0, 0.5, 0.3]))
        .unwrap();
    assert_eq!(result.num_channels(), 1);
    assert!(result.get(2).is_none());
}

#[test]
fn test_channel_outside_area_window_is_rejected() {
    let features = envelope(560.0, 1, 50.0, &[10000.0, 9500.0]);
    let store = build_store(&features, 101);
    let detector = IsotopeDetector::new(&store, params());
    // Channel 1 carries 95% of channel 0, far more than twice the expected 10%
    let result = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(560.0, 1, vec![1.0, 0.1]))
        .unwrap();
    assert_eq!(result.num_channels(), 1);

    let deep = IsotopeDetector::new(&store, params().with_search_mode(SearchMode::Deep));
    let result = deep
        .detect_isotopic_peaks(&AnalyteTarget::new(560.0, 1, vec![1.0, 0.9]))
        .unwrap();
    assert_eq!(result.num_channels(), 2);
}

#[test_log::test]
fn test_bleed_through_from_possible_peak() {
    // The channels of the 500 analyte, the second of which is also searched as
    // the monoisotopic peak of a second analyte
    let features = envelope(500.0, 1, 50.0, &[10000.0, 8000.0, 800.0]);
    let store = build_store(&features, 101);
    let detector = IsotopeDetector::new(&store, params());

    let first = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(500.0, 1, vec![1.0, 0.8]))
        .unwrap();
    // Another search reported a stronger peak at the same position, more than the
    // second analyte's own channel 0 can explain
    let mut possible = first.get(1).unwrap()[0].peak().clone();
    possible.area *= 2.0;

    let shifted = AnalyteTarget::new(500.0 + ISOTOPE_SPACING, 1, vec![1.0, 0.1]);
    let alone = detector.detect_isotopic_peaks(&shifted).unwrap();
    assert_eq!(alone.num_channels(), 2);

    let explained = detector
        .detect_isotopic_peaks(&shifted.clone().with_possible_peaks(vec![possible]))
        .unwrap();
    assert_eq!(explained.num_channels(), 1);
    assert!(explained
        .rejected
        .iter()
        .any(|p| p.status() == AreaStatus::OtherIso && p.peak().isotope == 1));
}

#[test]
fn test_recalculate_keeps_channels() {
    let features = envelope(500.0, 1, 50.0, &[10000.0, 5000.0]);
    let store = build_store(&features, 101);
    let detector = IsotopeDetector::new(&store, params());
    let found = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(500.0, 1, vec![1.0, 0.5]))
        .unwrap();
    assert_eq!(found.num_channels(), 2);

    let clipped = detector
        .recalculate_within_hard_limits(&found, 2.0, 3.0)
        .unwrap();
    assert_eq!(clipped.num_channels(), 2);
    for ((k, before), (j, after)) in found.iter().zip(clipped.iter()) {
        assert_eq!(k, j);
        assert!(after.peak().area < before.peak().area);
        assert!(after.peak().lower_valley >= 2.0 && after.peak().upper_valley <= 3.0);
    }

    assert!(matches!(
        detector.recalculate_within_hard_limits(&found, 0.0, 0.2),
        Err(DetectionError::EmptyChannel(0))
    ));
}

#[test]
fn test_missing_ms_level_is_an_error() {
    let store = build_store(&envelope(500.0, 1, 50.0, &[1000.0]), 101);
    assert!(store.prepare_msn_cache(2).is_ok());
    let detector = IsotopeDetector::new(&store, params());
    let err = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(500.0, 1, vec![1.0]).with_ms_level(2))
        .unwrap_err();
    assert!(matches!(err, DetectionError::Store(_)));
}

#[test_log::test]
fn test_weak_channel_explained_by_own_previous_isotope() {
    let features = envelope(610.0, 2, 50.0, &[10000.0, 2000.0]);
    let store = build_store(&features, 101);
    let detector = IsotopeDetector::new(&store, params());

    let strict = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(610.0, 2, vec![1.0, 0.5]))
        .unwrap();
    assert_eq!(strict.num_channels(), 1);
    assert!(strict
        .rejected
        .iter()
        .any(|p| p.status() == AreaStatus::OtherIso && p.peak().isotope == 1));

    // With the matching ratio the same signal is a proper isotope
    let matching = detector
        .detect_isotopic_peaks(&AnalyteTarget::new(610.0, 2, vec![1.0, 0.2]))
        .unwrap();
    assert_eq!(matching.num_channels(), 2);
}
