use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Value},
    Figment,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use mzdata::io::MassSpectrometryFormat;

use chromprobe::{AnalyteTarget, DetectionError, DetectionParams, IsotopeDetector};

use crate::args::{make_targets, ArgSearchMode, TargetArg};
use crate::proc::process_target;
use crate::progress::ProgressRecord;
use crate::reader::load_store;
use crate::time_range::TimeRange;
use crate::types::BUFFER_SIZE;
use crate::write::{open_output, write_records};

/// Read from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "chromprober.toml";
pub const ENV_PREFIX: &str = "CHROMPROBER_";

#[derive(Debug, Error)]
pub enum ChromProberError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("The input file format from STDIN was either unknown or not supported ({0:?})")]
    FormatUnknownOrNotSupportedErrorStdIn(MassSpectrometryFormat),
    #[error("Failed to parse arguments: {0}")]
    ArgumentError(
        #[source]
        #[from]
        clap::Error,
    ),
    #[error("Failed to load configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Failed to serialize configuration: {0}")]
    ConfigurationWriteError(
        #[source]
        #[from]
        toml::ser::Error,
    ),
    #[error("Failed to build thread pool: {0}")]
    ThreadPoolError(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
    #[error("No targets to search for, pass --target or list [[targets]] in a configuration file")]
    NoTargets,
    #[error("Target {0} is invalid: {1}")]
    InvalidTarget(usize, #[source] DetectionError),
    #[error("No spectra were read from {0}")]
    NoSpectra(String),
}

/// Chromatographic peak detection for the isotopes of target analytes.
///
/// Read a file or stream of spectra, search each target's isotope channels for
/// chromatographic peaks, and write one JSON record per target.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
#[serde(default)]
pub struct ChromProber {
    /// The path to read the input spectra from, or if '-' is passed, read from STDIN
    #[arg()]
    pub input_file: String,

    /// The path to write the JSON lines output to, or if '-' is passed, write to STDOUT.
    ///
    /// Paths ending in `.gz` are gzip compressed.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `chromprober.toml` in the working directory.
    /// Environment variables prefixed with `CHROMPROBER_` will be read too, with `__`
    /// separating nested keys.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The size of the buffer for queueing results for the output stream
    #[arg(short = 'w', long = "write-buffer-size", default_value_t = BUFFER_SIZE)]
    pub write_buffer_size: usize,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The time range to read spectra from, denoted (start?)-(stop?)
    #[arg(
        short='r',
        long="time-range",
        value_parser=TimeRange::from_str,
        value_name="BEGIN-END",
        long_help=r#"The time range to read spectra from, denoted (start?)-(stop?)

If a start is not specified, reading begins from the start of the run.
If a stop is not specified, reading stops at the end of the run.
"#
    )]
    pub time_range: Option<TimeRange>,

    /// Re-integrate every detected peak strictly inside this time range, denoted (start?)-(stop?)
    #[arg(
        short='H',
        long="hard-limits",
        value_parser=TimeRange::from_str,
        value_name="BEGIN-END",
    )]
    pub hard_limits: Option<TimeRange>,

    /// A monoisotopic m/z to search for, optionally with an expected retention time
    #[arg(short = 'm', long = "target", value_name = "MZ[@RT]")]
    pub target: Vec<TargetArg>,

    /// The charge state of the targets given with --target
    #[arg(
        short = 'z',
        long = "charge",
        default_value_t = 1,
        allow_negative_numbers = true
    )]
    pub charge: i32,

    /// The relative isotope abundances of the targets given with --target, monoisotopic first
    #[arg(
        short = 'a',
        long = "ratios",
        value_delimiter = ',',
        default_values_t = vec![1.0f64],
    )]
    pub ratios: Vec<f64>,

    /// The MS level to read the targets given with --target from
    #[arg(long = "ms-level", default_value_t = 1)]
    pub ms_level: u8,

    /// The m/z width of the bins used to build m/z profiles
    #[arg(long = "profile-bin-width", default_value_t = 0.0005)]
    pub profile_bin_width: f64,

    /// How to search for peak borders, overriding the configured detection parameters
    #[arg(short = 's', long = "search-mode")]
    pub search_mode: Option<ArgSearchMode>,

    /// Write the detection parameters in use to this path as TOML
    #[arg(long = "dump-config")]
    pub dump_config: Option<PathBuf>,

    #[arg(skip)]
    pub targets: Vec<AnalyteTarget>,

    #[arg(
        skip,
        help = "Specifies additional granular information about peak detection"
    )]
    pub params: DetectionParams,
}

impl Default for ChromProber {
    fn default() -> Self {
        Self {
            input_file: "-".to_string(),
            output_file: PathBuf::from("-"),
            log_file: None,
            config_file: None,
            write_buffer_size: BUFFER_SIZE,
            threads: -1,
            time_range: None,
            hard_limits: None,
            target: Vec::new(),
            charge: 1,
            ratios: vec![1.0],
            ms_level: 1,
            profile_bin_width: 0.0005,
            search_mode: None,
            dump_config: None,
            targets: Vec::new(),
            params: DetectionParams::default(),
        }
    }
}

impl ChromProber {
    /// Combine parsed arguments with configuration files and the environment.
    ///
    /// Later sources override earlier ones: argument defaults, `chromprober.toml`,
    /// `--config-file`, `CHROMPROBER_*` variables, then arguments given explicitly on
    /// the command line.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ChromProberError> {
        let args = Self::from_arg_matches(matches)?;
        let mut config =
            Figment::from(Serialized::defaults(&args)).merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = args.config_file.as_ref() {
            config = config.merge(Toml::file_exact(path));
        }
        config = config
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(args.explicit_arguments(matches)?));
        Ok(config.extract()?)
    }

    /// The serialized form of only those arguments the user passed on the command line
    fn explicit_arguments(&self, matches: &ArgMatches) -> Result<Dict, ChromProberError> {
        let command = Self::command();
        let given: HashSet<&str> = command
            .get_arguments()
            .map(|arg| arg.get_id().as_str())
            .filter(|id| matches.value_source(id) == Some(ValueSource::CommandLine))
            .collect();
        let dict = Value::serialize(self)?.into_dict().unwrap_or_default();
        Ok(dict
            .into_iter()
            .filter(|(key, _)| given.contains(key.as_str()))
            .collect())
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, ChromProberError> {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    pub fn detection_params(&self) -> DetectionParams {
        let params = self.params.clone();
        match self.search_mode {
            Some(mode) => params.with_search_mode(mode.into()),
            None => params,
        }
    }

    /// Every target to search for, configured targets first, each validated
    pub fn analyte_targets(&self) -> Result<Vec<AnalyteTarget>, ChromProberError> {
        let mut targets = self.targets.clone();
        targets.extend(make_targets(
            &self.target,
            self.charge,
            self.ms_level,
            &self.ratios,
        ));
        if targets.is_empty() {
            return Err(ChromProberError::NoTargets);
        }
        for (i, target) in targets.iter().enumerate() {
            target
                .validate()
                .map_err(|e| ChromProberError::InvalidTarget(i, e))?;
        }
        Ok(targets)
    }

    fn write_config(&self, path: &Path) -> Result<(), ChromProberError> {
        let text = toml::to_string_pretty(&self.detection_params())?;
        fs::write(path, text)?;
        info!("Wrote detection parameters to {}", path.display());
        Ok(())
    }

    pub fn main(&self) -> Result<(), ChromProberError> {
        info!(
            "chromprober v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("?")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        if let Some(path) = self.dump_config.as_ref() {
            self.write_config(path)?;
        }
        let targets = self.analyte_targets()?;
        info!("Searching for {} targets", targets.len());
        self.create_threadpool()?
            .install(|| self.run_workflow(targets))
    }

    fn run_workflow(&self, targets: Vec<AnalyteTarget>) -> Result<(), ChromProberError> {
        let start = Instant::now();
        let (store, mut prog) = load_store(
            &self.input_file,
            self.time_range.unwrap_or_default(),
            self.profile_bin_width,
        )?;
        info!("MS1 Spectra: {}", prog.ms1_spectra);
        info!("MSn Spectra: {}", prog.msn_spectra);
        if store.is_empty() {
            return Err(ChromProberError::NoSpectra(self.input_file.clone()));
        }
        let read_done = Instant::now();

        let writer = open_output(&self.output_file)?;
        let (sender, receiver) = crossbeam_channel::bounded(self.write_buffer_size);
        let write_task = thread::spawn(move || write_records(writer, receiver));

        let detector = IsotopeDetector::new(&store, self.detection_params());
        let hard_limits = self.hard_limits;
        prog += targets
            .into_par_iter()
            .enumerate()
            .map(|(i, target)| {
                let (record, prog) = process_target(&detector, i, target, hard_limits);
                if let Err(e) = sender.send((i, record)) {
                    warn!("Failed to send result for target {i}: {e}");
                }
                prog
            })
            .fold(ProgressRecord::default, ProgressRecord::sum)
            .sum::<ProgressRecord>();
        drop(sender);
        let processing_elapsed = read_done.elapsed();

        match write_task.join() {
            Ok(o) => {
                o?;
            }
            Err(e) => {
                warn!("Failed to join writer task: {e:?}");
            }
        }

        info!("Targets: {} | Failures: {}", prog.targets, prog.failures);
        info!(
            "Channels: {} | Peaks: {} | Rejected: {}",
            prog.channels, prog.peaks, prog.rejected
        );
        info!("Detection Time: {:0.3?}", processing_elapsed);
        info!("Total Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }
}
