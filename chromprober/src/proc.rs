use tracing::{debug, warn};

use chromprobe::{AnalyteTarget, ChromatogramSource, IsotopeDetector, Smoother};

use crate::progress::ProgressRecord;
use crate::time_range::TimeRange;
use crate::write::TargetRecord;

/// Detect the isotopic peaks of one target and, when `hard_limits` are given,
/// re-integrate them inside those limits.
///
/// Failures are recorded on the returned [`TargetRecord`] rather than aborting the run.
pub(crate) fn process_target<S: ChromatogramSource + ?Sized, M: Smoother>(
    detector: &IsotopeDetector<'_, S, M>,
    index: usize,
    target: AnalyteTarget,
    hard_limits: Option<TimeRange>,
) -> (TargetRecord, ProgressRecord) {
    let mut prog = ProgressRecord {
        targets: 1,
        ..Default::default()
    };
    let found = detector.detect_isotopic_peaks(&target);
    let mut record = TargetRecord::new(index, target);
    match found {
        Ok(found) => {
            prog.channels += found.num_channels();
            prog.peaks += found.num_peaks();
            prog.rejected += found.rejected.len();
            debug!(
                "Target {index} at {:.4}: {} channels, {} peaks",
                record.target.mz,
                found.num_channels(),
                found.num_peaks()
            );
            if let Some(limits) = hard_limits {
                if !found.is_empty() {
                    match detector.recalculate_within_hard_limits(&found, limits.start, limits.end) {
                        Ok(clipped) => record.recalculated = Some(clipped),
                        Err(e) => {
                            warn!("Failed to recalculate target {index} within {limits:?}: {e}");
                            prog.failures += 1;
                            record.error = Some(e.to_string());
                        }
                    }
                }
            }
            record.peaks = Some(found);
        }
        Err(e) => {
            warn!("Failed to process target {index} at {:.4}: {e}", record.target.mz);
            prog.failures += 1;
            record.error = Some(e.to_string());
        }
    }
    (record, prog)
}
