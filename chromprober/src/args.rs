use std::error::Error;
use std::fmt::Display;
use std::num::ParseFloatError;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use chromprobe::{AnalyteTarget, SearchMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
pub enum ArgSearchMode {
    #[default]
    /// Take the first acceptable valley on each side of a peak
    Greedy,
    /// Look past shallow valleys and use a stricter isotope area window
    Deep,
}

impl From<ArgSearchMode> for SearchMode {
    fn from(value: ArgSearchMode) -> Self {
        match value {
            ArgSearchMode::Greedy => SearchMode::Greedy,
            ArgSearchMode::Deep => SearchMode::Deep,
        }
    }
}

impl Display for ArgSearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A monoisotopic m/z given on the command line, optionally with the retention time it
/// is expected to elute at, written `MZ[@RT]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetArg {
    pub mz: f64,
    pub retention_time: Option<f64>,
}

#[derive(Debug)]
pub enum TargetArgParseError {
    MalformedMZ(ParseFloatError),
    MalformedRetentionTime(ParseFloatError),
    NotPositive(f64),
}

impl Display for TargetArgParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetArgParseError::MalformedMZ(e) => write!(f, "Failed to parse target m/z {e}"),
            TargetArgParseError::MalformedRetentionTime(e) => {
                write!(f, "Failed to parse target retention time {e}")
            }
            TargetArgParseError::NotPositive(mz) => {
                write!(f, "Target m/z must be positive, got {mz}")
            }
        }
    }
}

impl Error for TargetArgParseError {}

impl FromStr for TargetArg {
    type Err = TargetArgParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mz_s, rt_s) = match s.split_once('@') {
            Some((mz, rt)) => (mz, Some(rt)),
            None => (s, None),
        };
        let mz: f64 = mz_s
            .trim()
            .parse()
            .map_err(TargetArgParseError::MalformedMZ)?;
        if mz <= 0.0 {
            return Err(TargetArgParseError::NotPositive(mz));
        }
        let retention_time = rt_s
            .map(|rt| rt.trim().parse::<f64>())
            .transpose()
            .map_err(TargetArgParseError::MalformedRetentionTime)?;
        Ok(Self { mz, retention_time })
    }
}

impl Display for TargetArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.retention_time {
            Some(rt) => write!(f, "{}@{}", self.mz, rt),
            None => write!(f, "{}", self.mz),
        }
    }
}

/// Expand command line targets into full analyte descriptions sharing one charge, MS level
/// and isotope abundance ratio list
pub fn make_targets(
    targets: &[TargetArg],
    charge: i32,
    ms_level: u8,
    abundance_ratios: &[f64],
) -> Vec<AnalyteTarget> {
    targets
        .iter()
        .map(|t| {
            let analyte = AnalyteTarget::new(t.mz, charge, abundance_ratios.to_vec())
                .with_ms_level(ms_level);
            match t.retention_time {
                Some(rt) => analyte.with_retention_time(rt),
                None => analyte,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_target_fromstr() -> Result<(), TargetArgParseError> {
        let t: TargetArg = "512.25".parse()?;
        assert_eq!(t.mz, 512.25);
        assert_eq!(t.retention_time, None);

        let t: TargetArg = "512.25@31.5".parse()?;
        assert_eq!(t.retention_time, Some(31.5));
        assert_eq!(t.to_string(), "512.25@31.5");

        assert!(matches!(
            "abc".parse::<TargetArg>(),
            Err(TargetArgParseError::MalformedMZ(_))
        ));
        assert!(matches!(
            "512.25@x".parse::<TargetArg>(),
            Err(TargetArgParseError::MalformedRetentionTime(_))
        ));
        assert!(matches!(
            "-4".parse::<TargetArg>(),
            Err(TargetArgParseError::NotPositive(_))
        ));
        Ok(())
    }

    #[test]
    fn test_make_targets() {
        let args = vec![
            TargetArg {
                mz: 400.0,
                retention_time: None,
            },
            TargetArg {
                mz: 650.3,
                retention_time: Some(12.0),
            },
        ];
        let targets = make_targets(&args, 2, 1, &[1.0, 0.5]);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].charge, 2);
        assert_eq!(targets[0].retention_time, None);
        assert_eq!(targets[1].retention_time, Some(12.0));
        assert_eq!(targets[1].abundance_ratios, vec![1.0, 0.5]);
        assert_eq!(SearchMode::from(ArgSearchMode::Deep), SearchMode::Deep);
    }
}
