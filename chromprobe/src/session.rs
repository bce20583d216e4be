//! Per-call memoization of the expensive reads made while refining peaks
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;

use identity_hash::BuildIdentityHasher;
use tracing::trace;

use crate::chromatogram::{Chromatogram, MzProfile};
use crate::peak::{Peak, PeakKey, PeakTolerance};

/// Counts of cache lookups served from memory versus read from the source
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

fn cached<K: Eq + Hash, V: ?Sized, H: BuildHasher, E>(
    store: &mut HashMap<K, Rc<V>, H>,
    stats: &mut CacheStats,
    key: K,
    read: impl FnOnce() -> Result<Rc<V>, E>,
) -> Result<Rc<V>, E> {
    match store.entry(key) {
        Entry::Occupied(entry) => {
            stats.hits += 1;
            Ok(Rc::clone(entry.get()))
        }
        Entry::Vacant(entry) => {
            stats.misses += 1;
            let value = read()?;
            Ok(Rc::clone(entry.insert(value)))
        }
    }
}

/// The scratch state of a single detection call.
///
/// Every sub-read made while refining a coarse peak (the m/z profile, the small and
/// broad chromatograms) is memoized against that coarse peak, compared by
/// [`approx_equal`](crate::peak::approx_equal). Cached values are handed out as shared
/// [`Rc`] handles, a hit never copies the trace. A session is created at the start of a
/// top-level call and dropped at its end; it is never shared between analytes or threads.
#[derive(Debug, Default)]
pub struct DetectionSession {
    tolerance: PeakTolerance,
    channel_traces: HashMap<usize, Rc<Chromatogram>, BuildIdentityHasher<usize>>,
    profiles: HashMap<PeakKey, Rc<MzProfile>>,
    small_chromatograms: HashMap<PeakKey, Rc<Chromatogram>>,
    broad_chromatograms: HashMap<PeakKey, Rc<Chromatogram>>,
    scan_times: HashMap<usize, Rc<[f64]>, BuildIdentityHasher<usize>>,
    stats: CacheStats,
}

impl DetectionSession {
    pub fn new(tolerance: PeakTolerance) -> Self {
        Self {
            tolerance,
            ..Default::default()
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn key_for(&self, peak: &Peak) -> PeakKey {
        PeakKey::new(peak.clone(), self.tolerance)
    }

    /// The smoothed coarse chromatogram of an isotope channel
    pub fn channel_trace<E>(
        &mut self,
        isotope: usize,
        read: impl FnOnce() -> Result<Chromatogram, E>,
    ) -> Result<Rc<Chromatogram>, E> {
        cached(&mut self.channel_traces, &mut self.stats, isotope, || {
            trace!("Reading channel {isotope} trace");
            read().map(Rc::new)
        })
    }

    /// The m/z profile read around `coarse`'s apex
    pub fn profile<E>(
        &mut self,
        coarse: &Peak,
        read: impl FnOnce() -> Result<MzProfile, E>,
    ) -> Result<Rc<MzProfile>, E> {
        let key = self.key_for(coarse);
        cached(&mut self.profiles, &mut self.stats, key, || read().map(Rc::new))
    }

    /// The tight m/z window chromatogram read for `coarse`
    pub fn small_chromatogram<E>(
        &mut self,
        coarse: &Peak,
        read: impl FnOnce() -> Result<Chromatogram, E>,
    ) -> Result<Rc<Chromatogram>, E> {
        let key = self.key_for(coarse);
        cached(&mut self.small_chromatograms, &mut self.stats, key, || {
            read().map(Rc::new)
        })
    }

    /// The profile-wide m/z window chromatogram read for `coarse`
    pub fn broad_chromatogram<E>(
        &mut self,
        coarse: &Peak,
        read: impl FnOnce() -> Result<Chromatogram, E>,
    ) -> Result<Rc<Chromatogram>, E> {
        let key = self.key_for(coarse);
        cached(&mut self.broad_chromatograms, &mut self.stats, key, || {
            read().map(Rc::new)
        })
    }

    /// The sorted scan times of an MS level
    pub fn scan_times<E>(
        &mut self,
        ms_level: u8,
        read: impl FnOnce() -> Result<Vec<f64>, E>,
    ) -> Result<Rc<[f64]>, E> {
        cached(&mut self.scan_times, &mut self.stats, ms_level as usize, || {
            read().map(Rc::from)
        })
    }
}
