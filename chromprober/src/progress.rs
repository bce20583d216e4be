use std::iter::Sum;
use std::ops::{Add, AddAssign};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub targets: usize,
    pub channels: usize,
    pub peaks: usize,
    pub rejected: usize,
    pub failures: usize,
    pub ms1_spectra: usize,
    pub msn_spectra: usize,
    pub signal_points: usize,
}

impl ProgressRecord {
    pub fn sum(self, other: Self) -> Self {
        self + other
    }
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.targets += rhs.targets;
        self.channels += rhs.channels;
        self.peaks += rhs.peaks;
        self.rejected += rhs.rejected;
        self.failures += rhs.failures;
        self.ms1_spectra += rhs.ms1_spectra;
        self.msn_spectra += rhs.msn_spectra;
        self.signal_points += rhs.signal_points;
    }
}

impl Sum for ProgressRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Self::sum)
    }
}
