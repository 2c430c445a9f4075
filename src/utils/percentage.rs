use std::{fmt::Display, ops::Deref};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize)]
#[serde(transparent)]
pub struct Percentage(f64);

impl Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

impl Percentage {
    pub fn zero() -> Self {
        Percentage(0.)
    }
}

impl Deref for Percentage {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Share of `part` in `whole`. An empty whole yields zero rather than NaN.
pub fn count_percentage(part: usize, whole: usize) -> Percentage {
    if whole == 0 {
        return Percentage::zero();
    }
    Percentage(part as f64 / whole as f64 * 100.)
}
