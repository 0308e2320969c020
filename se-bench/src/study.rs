// Copyright (c) Facebook, Inc. and its affiliates.

/// Page-cache measurements collected during monitoring, one per tick.
/// Append-only; insertion order is time order.
#[derive(Debug, Clone, Default)]
pub struct SampleSeries(Vec<u64>);

impl SampleSeries {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, val: u64) {
        self.0.push(val);
    }

    /// None is the explicit not-available marker for an empty series. "no
    /// samples" and "all-zero samples" must stay distinguishable downstream.
    pub fn median(&self) -> Option<f64> {
        if self.0.is_empty() {
            return None;
        }
        let vals: Vec<f64> = self.0.iter().map(|&v| v as f64).collect();
        Some(statistical::median(&vals))
    }

    pub fn max(&self) -> u64 {
        self.0.iter().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(vals: &[u64]) -> SampleSeries {
        let mut s = SampleSeries::new();
        for &v in vals {
            s.push(v);
        }
        s
    }

    #[test]
    fn test_median() {
        assert_eq!(series(&[]).median(), None);
        assert_eq!(series(&[5]).median(), Some(5.0));
        assert_eq!(series(&[1, 3, 2, 4]).median(), Some(2.5));
        assert_eq!(series(&[1, 3, 2]).median(), Some(2.0));
        // All-zero is a real median, not the NA marker.
        assert_eq!(series(&[0, 0, 0]).median(), Some(0.0));
    }

    #[test]
    fn test_max() {
        assert_eq!(series(&[]).max(), 0);
        assert_eq!(series(&[10, 30, 20]).max(), 30);
    }
}
