use crate::core::hash::{DigestSet, PerceptualAlgorithm};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Score reported when two digest sets share no comparable perceptual hash.
pub const UNRELATED_SCORE: f64 = f64::INFINITY;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompareError {
    #[error("Empty {algorithm} hash, the file was not hashed correctly")]
    EmptyHash { algorithm: PerceptualAlgorithm },
}

/// Outcome of comparing two digest sets. Lower is more similar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimilarityScore {
    /// Same bytes, or every shared perceptual hash at distance zero.
    Identical,
    /// Hamming distances over the shared perceptual algorithms.
    Distance { mean: f64, max: u32 },
    /// Nothing to compare.
    Unrelated,
}

impl SimilarityScore {
    /// Numeric score: `0` for identical, the mean distance, or [`UNRELATED_SCORE`].
    pub fn value(&self) -> f64 {
        match self {
            Self::Identical => 0.0,
            Self::Distance { mean, .. } => *mean,
            Self::Unrelated => UNRELATED_SCORE,
        }
    }

    pub fn is_identical(&self) -> bool {
        matches!(self, Self::Identical)
    }
}

impl fmt::Display for SimilarityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identical => f.write_str("identical (0)"),
            Self::Distance { mean, max } => write!(f, "mean distance {:.2}, max {}", mean, max),
            Self::Unrelated => f.write_str("unrelated (no common perceptual hash)"),
        }
    }
}

/// Thresholds deciding when a [`SimilarityScore::Distance`] counts as the same picture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityPolicy {
    pub max_distance: u32,
    pub avg_distance: f64,
}

impl SimilarityPolicy {
    pub fn matches(&self, score: &SimilarityScore) -> bool {
        match score {
            SimilarityScore::Identical => true,
            SimilarityScore::Distance { mean, max } => {
                *max <= self.max_distance && *mean <= self.avg_distance
            }
            SimilarityScore::Unrelated => false,
        }
    }
}

impl Default for SimilarityPolicy {
    fn default() -> Self {
        Self {
            max_distance: 3,
            avg_distance: 2.0,
        }
    }
}

/// Score two digest sets.
///
/// An exact hash match wins regardless of the perceptual data. Otherwise every
/// perceptual algorithm present in both sets with the same width is compared.
pub fn compare(a: &DigestSet, b: &DigestSet) -> Result<SimilarityScore, CompareError> {
    if a.exact == b.exact {
        return Ok(SimilarityScore::Identical);
    }

    let mut distances = Vec::new();
    for (algorithm, left) in &a.perceptual {
        let Some(right) = b.perceptual.get(algorithm) else {
            continue;
        };

        if left.is_empty() || right.is_empty() {
            return Err(CompareError::EmptyHash {
                algorithm: *algorithm,
            });
        }

        match left.distance(right) {
            Some(distance) => distances.push(distance),
            None => log::trace!(
                "{} hashes differ in width ({} vs {} bits), not comparable",
                algorithm,
                left.bit_len(),
                right.bit_len()
            ),
        }
    }

    if distances.is_empty() {
        return Ok(SimilarityScore::Unrelated);
    }

    let max = distances.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return Ok(SimilarityScore::Identical);
    }

    let mean = distances.iter().map(|d| f64::from(*d)).sum::<f64>() / distances.len() as f64;
    Ok(SimilarityScore::Distance { mean, max })
}

/// Applies a [`SimilarityPolicy`] on top of [`compare`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    policy: SimilarityPolicy,
}

impl Comparator {
    pub fn new(policy: SimilarityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SimilarityPolicy {
        &self.policy
    }

    pub fn compare(&self, a: &DigestSet, b: &DigestSet) -> Result<SimilarityScore, CompareError> {
        compare(a, b)
    }

    /// Whether both digest sets describe the same picture under the policy.
    pub fn is_same(&self, a: &DigestSet, b: &DigestSet) -> Result<bool, CompareError> {
        let score = compare(a, b)?;
        Ok(self.policy.matches(&score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{BitVector, ExactHash};

    fn digests(exact: &str, perceptual: &[(PerceptualAlgorithm, &str)]) -> DigestSet {
        let mut set = DigestSet::exact_only(ExactHash(exact.to_string()));
        for (algorithm, hex) in perceptual {
            set = set.with_perceptual(*algorithm, hex.parse::<BitVector>().unwrap());
        }
        set
    }

    #[test]
    fn test_exact_match_beats_perceptual_data() {
        let a = digests("aaa", &[(PerceptualAlgorithm::Average, "ffff")]);
        let b = digests("aaa", &[(PerceptualAlgorithm::Average, "0000")]);
        let c = digests("aaa", &[]);

        assert_eq!(compare(&a, &b).unwrap(), SimilarityScore::Identical);
        assert_eq!(compare(&a, &c).unwrap().value(), 0.0);

        // Even an empty perceptual hash is not looked at
        let empty = digests("aaa", &[(PerceptualAlgorithm::Average, "")]);
        assert!(compare(&a, &empty).unwrap().is_identical());
    }

    #[test]
    fn test_compare_is_reflexive() {
        let a = digests(
            "aaa",
            &[
                (PerceptualAlgorithm::Average, "f0f0"),
                (PerceptualAlgorithm::Difference, "0ff0"),
            ],
        );
        assert!(compare(&a, &a).unwrap().is_identical());
    }

    #[test]
    fn test_zero_perceptual_distance_is_identical() {
        let a = digests("aaa", &[(PerceptualAlgorithm::Average, "f0f0")]);
        let b = digests("bbb", &[(PerceptualAlgorithm::Average, "f0f0")]);
        assert_eq!(compare(&a, &b).unwrap(), SimilarityScore::Identical);
    }

    #[test]
    fn test_mean_of_distances() {
        let a = digests(
            "aaa",
            &[
                (PerceptualAlgorithm::Average, "ff00"),
                (PerceptualAlgorithm::Difference, "ff00"),
                (PerceptualAlgorithm::Block, "ff00"),
            ],
        );
        let b = digests(
            "bbb",
            &[
                (PerceptualAlgorithm::Average, "fe00"),
                (PerceptualAlgorithm::Difference, "f800"),
                (PerceptualAlgorithm::Block, "ff00"),
            ],
        );

        let score = compare(&a, &b).unwrap();
        assert_eq!(score, SimilarityScore::Distance { mean: 4.0 / 3.0, max: 3 });
        assert!(SimilarityPolicy::default().matches(&score));

        let strict = SimilarityPolicy {
            max_distance: 2,
            avg_distance: 2.0,
        };
        assert!(!strict.matches(&score));
    }

    #[test]
    fn test_no_common_algorithm_is_unrelated() {
        let a = digests("aaa", &[(PerceptualAlgorithm::Average, "ff00")]);
        let b = digests("bbb", &[(PerceptualAlgorithm::Difference, "ff00")]);
        let score = compare(&a, &b).unwrap();

        assert_eq!(score, SimilarityScore::Unrelated);
        assert_eq!(score.value(), UNRELATED_SCORE);
        assert!(!SimilarityPolicy::default().matches(&score));

        // Different widths are not comparable either
        let wide = digests("ccc", &[(PerceptualAlgorithm::Average, "ff0000")]);
        assert_eq!(compare(&a, &wide).unwrap(), SimilarityScore::Unrelated);
    }

    #[test]
    fn test_empty_hash_is_an_error() {
        let a = digests("aaa", &[(PerceptualAlgorithm::Average, "")]);
        let b = digests("bbb", &[(PerceptualAlgorithm::Average, "ff00")]);

        assert_eq!(
            compare(&a, &b),
            Err(CompareError::EmptyHash {
                algorithm: PerceptualAlgorithm::Average
            })
        );
        assert!(Comparator::default().is_same(&b, &a).is_err());
    }

    #[test]
    fn test_comparator_applies_policy() {
        let a = digests("aaa", &[(PerceptualAlgorithm::Average, "ffff")]);
        let b = digests("bbb", &[(PerceptualAlgorithm::Average, "fff0")]);

        let comparator = Comparator::default();
        assert!(!comparator.is_same(&a, &b).unwrap());

        let loose = Comparator::new(SimilarityPolicy {
            max_distance: 4,
            avg_distance: 4.0,
        });
        assert!(loose.is_same(&a, &b).unwrap());
    }
}
