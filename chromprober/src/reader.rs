//! Loading spectra from mzML and MGF files or streams, and from mzMLb and Thermo RAW
//! files when those features are enabled, into a [`ScanStore`]
use std::fs;
use std::io;
use std::time::Instant;

use tracing::{debug, info, warn};

use mzdata::io::{
    infer_format, infer_from_stream, mgf::MGFReaderType, mzml::MzMLReaderType,
    MassSpectrometryFormat, PreBufferedStream, RestartableGzDecoder, StreamingSpectrumIterator,
};
#[cfg(feature = "mzmlb")]
use mzdata::io::mzmlb::MzMLbReaderType;
#[cfg(feature = "thermo")]
use mzdata::io::thermo::ThermoRawReaderType;
use mzdata::prelude::*;
use mzdata::spectrum::SignalContinuity;

use chromprobe::ScanStore;

use crate::driver::ChromProberError;
use crate::progress::ProgressRecord;
use crate::time_range::TimeRange;
use crate::types::{SpectrumType, PEAK_COUNT_THRESHOLD_WARNING};

/// Reduce a spectrum to its centroided m/z and intensity arrays, picking peaks from
/// profile spectra first
pub(crate) fn centroid_arrays(scan: &mut SpectrumType) -> Option<(Vec<f64>, Vec<f32>)> {
    let id = scan.id().to_string();
    let peaks = match scan.signal_continuity() {
        SignalContinuity::Profile => {
            if let Err(e) = scan.pick_peaks(1.0) {
                warn!("Failed to pick peaks for {id}: {e:?}");
                return None;
            }
            scan.description_mut().signal_continuity = SignalContinuity::Centroid;
            scan.peaks.as_ref()?
        }
        _ => match scan.try_build_centroids() {
            Ok(peaks) => peaks,
            Err(e) => {
                warn!("Failed to read centroids for {id}: {e:?}");
                return None;
            }
        },
    };
    let (mzs, intensities) = peaks.iter().map(|p| (p.mz, p.intensity)).unzip();
    Some((mzs, intensities))
}

/// Accumulates spectra from any reader into a [`ScanStore`], restricted to a time range
pub(crate) struct StoreBuilder {
    pub store: ScanStore,
    pub time_range: TimeRange,
    pub progress: ProgressRecord,
}

impl StoreBuilder {
    pub fn new(store: ScanStore, time_range: TimeRange) -> Self {
        Self {
            store,
            time_range,
            progress: ProgressRecord::default(),
        }
    }

    pub fn add_spectrum(&mut self, mut scan: SpectrumType) {
        let time = scan.start_time();
        if !self.time_range.contains_time(time) {
            return;
        }
        let ms_level = scan.ms_level();
        let scan_number = scan.index() as u32 + 1;
        let Some((mzs, intensities)) = centroid_arrays(&mut scan) else {
            return;
        };
        if mzs.len() > PEAK_COUNT_THRESHOLD_WARNING {
            debug!(
                "{} has {} peaks, more than expected after peak picking",
                scan.id(),
                mzs.len()
            );
        }
        if ms_level > 1 {
            self.progress.msn_spectra += 1;
        } else {
            self.progress.ms1_spectra += 1;
        }
        self.progress.signal_points += mzs.len();
        self.store
            .push_scan(ms_level, scan_number, time, mzs, intensities);
    }

    /// Consume spectra until the end of the time range is passed
    pub fn consume<I: Iterator<Item = SpectrumType>>(&mut self, reader: I) {
        let end = self.time_range.end;
        for scan in reader.take_while(|s| s.start_time() <= end) {
            self.add_spectrum(scan);
        }
    }

    pub fn finish(self) -> (ScanStore, ProgressRecord) {
        (self.store, self.progress)
    }
}

/// Read `input_file`, or STDIN when it is `-`, into a new [`ScanStore`]
pub(crate) fn load_store(
    input_file: &str,
    time_range: TimeRange,
    profile_bin_width: f64,
) -> Result<(ScanStore, ProgressRecord), ChromProberError> {
    let start = Instant::now();
    let mut builder = StoreBuilder::new(ScanStore::new(profile_bin_width), time_range);
    if input_file == "-" {
        let mut buffered = PreBufferedStream::new_with_buffer_size(io::stdin(), 2usize.pow(20))?;
        let (ms_format, compressed) = infer_from_stream(&mut buffered)?;
        debug!("Detected {ms_format:?} from STDIN (compressed? {compressed})");
        match ms_format {
            MassSpectrometryFormat::MGF => {
                if compressed {
                    builder.consume(StreamingSpectrumIterator::new(MGFReaderType::new(
                        RestartableGzDecoder::new(io::BufReader::new(buffered)),
                    )));
                } else {
                    builder.consume(StreamingSpectrumIterator::new(MGFReaderType::new(buffered)));
                }
            }
            MassSpectrometryFormat::MzML => {
                if compressed {
                    builder.consume(StreamingSpectrumIterator::new(MzMLReaderType::new(
                        RestartableGzDecoder::new(io::BufReader::new(buffered)),
                    )));
                } else {
                    builder.consume(StreamingSpectrumIterator::new(MzMLReaderType::new(
                        buffered,
                    )));
                }
            }
            _ => return Err(ChromProberError::FormatUnknownOrNotSupportedErrorStdIn(ms_format)),
        }
    } else {
        let (ms_format, compressed) = infer_format(input_file)?;
        debug!("Detected {ms_format:?} from path (compressed? {compressed})");
        match ms_format {
            MassSpectrometryFormat::MGF => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        input_file,
                    )?));
                    builder.consume(StreamingSpectrumIterator::new(MGFReaderType::new(fh)));
                } else {
                    builder.consume(MGFReaderType::open_path(input_file)?);
                }
            }
            MassSpectrometryFormat::MzML => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        input_file,
                    )?));
                    builder.consume(StreamingSpectrumIterator::new(MzMLReaderType::new(fh)));
                } else {
                    builder.consume(MzMLReaderType::open_path(input_file)?);
                }
            }
            #[cfg(feature = "mzmlb")]
            MassSpectrometryFormat::MzMLb => {
                builder.consume(MzMLbReaderType::open_path(input_file.to_string())?);
            }
            #[cfg(feature = "thermo")]
            MassSpectrometryFormat::ThermoRaw => {
                builder.consume(ThermoRawReaderType::open_path(input_file.to_string())?);
            }
            _ => {
                return Err(ChromProberError::FormatUnknownOrNotSupportedError(
                    input_file.to_string(),
                    ms_format,
                ))
            }
        }
    }
    let (store, progress) = builder.finish();
    info!(
        "Loaded {} spectra with {} points in {:0.3?}",
        progress.ms1_spectra + progress.msn_spectra,
        progress.signal_points,
        start.elapsed()
    );
    Ok((store, progress))
}
