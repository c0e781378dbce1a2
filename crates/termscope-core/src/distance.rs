//! Vector distance metrics used for similarity ranking.
//!
//! Lower distance means more similar. A metric returns `None` for pairs it
//! cannot compare (dimension mismatch, empty or zero-norm vectors); such
//! candidates are simply not ranked.

use std::sync::Arc;

/// Distance between two embedding vectors.
pub trait Distance: Send + Sync {
    fn distance(&self, a: &[f32], b: &[f32]) -> Option<f32>;

    fn name(&self) -> &'static str;
}

/// `1 - cos(a, b)`, in `[0, 2]`. Matches pgvector's `<=>` operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl Distance for CosineDistance {
    fn distance(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.is_empty() || a.len() != b.len() {
            return None;
        }
        let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
        for (x, y) in a.iter().zip(b) {
            let (x, y) = (*x as f64, *y as f64);
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return None;
        }
        let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
        let d = (1.0 - cos).clamp(0.0, 2.0);
        d.is_finite().then_some(d as f32)
    }

    fn name(&self) -> &'static str {
        "cosine"
    }
}

/// Euclidean (L2) distance. Matches pgvector's `<->` operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanDistance;

impl Distance for EuclideanDistance {
    fn distance(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.is_empty() || a.len() != b.len() {
            return None;
        }
        let sum: f64 = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = *x as f64 - *y as f64;
                d * d
            })
            .sum();
        let d = sum.sqrt();
        d.is_finite().then_some(d as f32)
    }

    fn name(&self) -> &'static str {
        "l2"
    }
}

/// Configurable choice of metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn build(self) -> Arc<dyn Distance> {
        match self {
            Self::Cosine => Arc::new(CosineDistance),
            Self::L2 => Arc::new(EuclideanDistance),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::L2),
            _ => Err(format!("Invalid distance metric: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_cosine_identical_is_zero() {
        let d = CosineDistance.distance(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
        assert!(approx(d, 0.0));
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(approx(CosineDistance.distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 1.0));
        assert!(approx(CosineDistance.distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap(), 2.0));
    }

    #[test]
    fn test_cosine_rejects_incomparable() {
        assert!(CosineDistance.distance(&[1.0], &[1.0, 0.0]).is_none());
        assert!(CosineDistance.distance(&[], &[]).is_none());
        assert!(CosineDistance.distance(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn test_l2() {
        assert!(approx(EuclideanDistance.distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 5.0));
        assert!(EuclideanDistance.distance(&[0.0], &[3.0, 4.0]).is_none());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("COSINE".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert!("dot".parse::<DistanceMetric>().is_err());
        assert_eq!(" cosine\n".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!(DistanceMetric::L2.build().name(), "l2");
        assert_eq!(DistanceMetric::default().to_string(), "cosine");
    }
}
