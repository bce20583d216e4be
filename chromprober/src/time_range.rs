use std::{error::Error, fmt::Display, num::ParseFloatError, ops::Range, str::FromStr};

use mzpeaks::coordinate::Span1D;
use serde::{Deserialize, Serialize};

/// A closed interval of retention times, in minutes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains_time(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl Span1D for TimeRange {
    type DimType = f64;

    fn start(&self) -> Self::DimType {
        self.start
    }

    fn end(&self) -> Self::DimType {
        self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: f64::INFINITY,
        }
    }
}

#[derive(Debug)]
pub enum TimeRangeParseError {
    MalformedStart(ParseFloatError),
    MalformedEnd(ParseFloatError),
}

impl Display for TimeRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeRangeParseError::MalformedStart(e) => {
                write!(f, "Failed to parse time range start {e}")
            }
            TimeRangeParseError::MalformedEnd(e) => {
                write!(f, "Failed to parse time range end {e}")
            }
        }
    }
}

impl Error for TimeRangeParseError {}

fn parse_bound(
    token: Option<&str>,
    default: f64,
    err: fn(ParseFloatError) -> TimeRangeParseError,
) -> Result<f64, TimeRangeParseError> {
    match token.map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => s.parse().map_err(err),
    }
}

impl FromStr for TimeRange {
    type Err = TimeRangeParseError;

    /// Parse `start-end`, `start:end` or `start end`, where either bound may be omitted
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = [' ', ':', '-']
            .into_iter()
            .find(|c| s.contains(*c))
            .unwrap_or(' ');
        let mut tokens = s.splitn(2, sep);
        let start = parse_bound(tokens.next(), 0.0, TimeRangeParseError::MalformedStart)?;
        let end = parse_bound(tokens.next(), f64::INFINITY, TimeRangeParseError::MalformedEnd)?;
        Ok(TimeRange { start, end })
    }
}

impl From<Range<f64>> for TimeRange {
    fn from(value: Range<f64>) -> Self {
        Self::new(value.start, value.end)
    }
}

impl From<(f64, f64)> for TimeRange {
    fn from(value: (f64, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_time_fromstr() -> Result<(), TimeRangeParseError> {
        let t: TimeRange = "52.0-".parse()?;
        assert_eq!(t.start(), 52.0);
        assert_eq!(t.end(), f64::INFINITY);

        let t: TimeRange = "-52.0".parse()?;
        assert_eq!(t.start(), 0.0);
        assert_eq!(t.end(), 52.0);

        let t: TimeRange = "32:52.5".parse()?;
        assert_eq!(t.start(), 32.0);
        assert_eq!(t.end(), 52.5);
        assert!(t.contains_time(40.0));
        assert!(!t.contains_time(60.0));

        let t: TimeRange = "-".parse()?;
        assert_eq!(t, TimeRange::default());
        Ok(())
    }

    #[test]
    fn test_time_fromstr_malformed() {
        assert!(matches!(
            "a-".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
        assert!(matches!(
            "-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedEnd(_))
        ));
        // Both ends are bad, the start is reported first
        assert!(matches!(
            "a-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
        let err = " a-z".parse::<TimeRange>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to parse time range end invalid float literal"
        );
    }
}
