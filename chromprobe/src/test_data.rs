//! Synthetic LC-MS features for unit tests
use crate::store::ScanStore;

const MZ_STEP: f64 = 0.0005;
const MZ_SIGMA: f64 = 0.001;
const MIN_INTENSITY: f32 = 0.5;

/// A Gaussian elution profile in time that is also Gaussian in m/z
#[derive(Debug, Clone, Copy)]
pub struct SyntheticFeature {
    pub mz: f64,
    pub apex_scan: f64,
    pub amplitude: f64,
    pub sigma_scans: f64,
}

impl SyntheticFeature {
    pub fn new(mz: f64, apex_scan: f64, amplitude: f64, sigma_scans: f64) -> Self {
        Self {
            mz,
            apex_scan,
            amplitude,
            sigma_scans,
        }
    }

    pub fn points(&self, scan: usize) -> impl Iterator<Item = (f64, f32)> + '_ {
        let dt = (scan as f64 - self.apex_scan) / self.sigma_scans;
        let height = self.amplitude * (-dt * dt / 2.0).exp();
        (-4i32..=4).filter_map(move |k| {
            let offset = k as f64 * MZ_STEP;
            let inten = (height * (-(offset * offset) / (2.0 * MZ_SIGMA * MZ_SIGMA)).exp()) as f32;
            (inten >= MIN_INTENSITY).then_some((self.mz + offset, inten))
        })
    }

    /// The sum of every point this feature contributes, times the scan spacing
    pub fn total_area(&self, n_scans: usize, dt: f64) -> f64 {
        (0..n_scans)
            .flat_map(|i| self.points(i))
            .map(|(_, inten)| inten as f64 * dt)
            .sum()
    }
}

pub fn feature_store(features: &[SyntheticFeature], n_scans: usize, dt: f64) -> ScanStore {
    let mut store = ScanStore::default();
    for i in 0..n_scans {
        let (mzs, intensities) = features.iter().flat_map(|f| f.points(i)).unzip();
        store.push_scan(1, i as u32 + 1, i as f64 * dt, mzs, intensities);
    }
    store
}
