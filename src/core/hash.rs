use clap::ValueEnum;
use image::ImageReader;
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Side length of the hash grid for a resolution factor of 1.
const BASE_HASH_SIDE: u32 = 4;

/// `(pixel count upper bound, factor)` tiers used by [`Resolution::Auto`].
const AUTO_TIERS: [(u64, u32); 5] = [
    (100_000, 1),
    (2_000_000, 2),
    (10_000_000, 4),
    (16_000_000, 8),
    (32_000_000, 16),
];

/// Largest resolution factor, fixed or picked automatically.
const MAX_FACTOR: u32 = 32;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("The file `{}` does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("The path `{}` is not a file", path.display())]
    NotAFile { path: PathBuf },

    #[error("The file `{}` is not a supported image: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Invalid resolution factor `{value}`: expected `auto` or a number from 1 to 32")]
    InvalidResolution { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Perceptual hash algorithms the digest computer can run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PerceptualAlgorithm {
    /// aHash: pixels compared against the mean
    Average,
    /// dHash: horizontal gradients
    Difference,
    /// pHash: DCT-preprocessed mean hash
    Perceptual,
    /// Blockhash
    Block,
}

impl PerceptualAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Difference => "difference",
            Self::Perceptual => "perceptual",
            Self::Block => "block",
        }
    }

    fn hasher(&self, side: u32) -> image_hasher::Hasher {
        let config = HasherConfig::new().hash_size(side, side);
        let config = match self {
            Self::Average => config.hash_alg(HashAlg::Mean),
            Self::Difference => config.hash_alg(HashAlg::Gradient),
            Self::Perceptual => config.hash_alg(HashAlg::Mean).preproc_dct(),
            Self::Block => config.hash_alg(HashAlg::Blockhash),
        };
        config.to_hasher()
    }
}

impl fmt::Display for PerceptualAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cryptographic content digest (BLAKE3, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExactHash(pub String);

impl ExactHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ExactHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseBitVectorError {
    #[error("hex bit vector has an odd number of digits")]
    OddLength,

    #[error("invalid hex digit `{0}` in bit vector")]
    InvalidDigit(char),
}

/// Fixed-width bit vector produced by a perceptual hash, stored as hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BitVector(Vec<u8>);

impl BitVector {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// An empty vector is what a failed upstream hash looks like once stored.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Hamming distance, or `None` when the vectors have different widths.
    pub fn distance(&self, other: &BitVector) -> Option<u32> {
        if self.0.len() != other.0.len() {
            return None;
        }

        Some(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl FromStr for BitVector {
    type Err = ParseBitVectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = s.trim().chars().collect();
        if digits.len() % 2 != 0 {
            return Err(ParseBitVectorError::OddLength);
        }

        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let high = pair[0]
                .to_digit(16)
                .ok_or(ParseBitVectorError::InvalidDigit(pair[0]))?;
            let low = pair[1]
                .to_digit(16)
                .ok_or(ParseBitVectorError::InvalidDigit(pair[1]))?;
            bytes.push((high * 16 + low) as u8);
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BitVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BitVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// All message digests known for one file.
///
/// Serialises as `{ "exact": "<hex>", "<algorithm>": "<hex>", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    pub exact: ExactHash,
    #[serde(flatten)]
    pub perceptual: BTreeMap<PerceptualAlgorithm, BitVector>,
}

impl DigestSet {
    pub fn exact_only(exact: ExactHash) -> Self {
        Self {
            exact,
            perceptual: BTreeMap::new(),
        }
    }

    pub fn with_perceptual(mut self, algorithm: PerceptualAlgorithm, bits: BitVector) -> Self {
        self.perceptual.insert(algorithm, bits);
        self
    }
}

/// Digest sets keyed by absolute file path.
pub type DigestMap = BTreeMap<PathBuf, DigestSet>;

/// Resolution of the perceptual hash grid.
///
/// A factor `f` hashes on a `4f x 4f` grid, so every step doubles the side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Pick the factor from the image's pixel count.
    Auto,
    Fixed(u32),
}

impl Resolution {
    pub fn validate(&self) -> Result<(), HashError> {
        match self {
            Self::Fixed(factor) if *factor == 0 || *factor > MAX_FACTOR => {
                Err(HashError::InvalidResolution {
                    value: factor.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn factor(&self, width: u32, height: u32) -> Result<u32, HashError> {
        self.validate()?;
        match self {
            Self::Fixed(factor) => Ok(*factor),
            Self::Auto => {
                let pixels = u64::from(width) * u64::from(height);
                Ok(AUTO_TIERS
                    .iter()
                    .find(|(limit, _)| pixels < *limit)
                    .map(|(_, factor)| *factor)
                    .unwrap_or(MAX_FACTOR))
            }
        }
    }

    pub fn hash_side(&self, width: u32, height: u32) -> Result<u32, HashError> {
        let factor = self.factor(width, height)?;
        BASE_HASH_SIDE
            .checked_mul(factor)
            .ok_or_else(|| HashError::InvalidResolution {
                value: factor.to_string(),
            })
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::Fixed(2)
    }
}

impl FromStr for Resolution {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }

        let invalid = || HashError::InvalidResolution {
            value: value.to_string(),
        };
        let factor: u32 = value.parse().map_err(|_| invalid())?;
        let resolution = Self::Fixed(factor);
        resolution.validate().map_err(|_| invalid())?;
        Ok(resolution)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(factor) => write!(f, "{}", factor),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashOptions {
    pub perceptual: Vec<PerceptualAlgorithm>,
    pub resolution: Resolution,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            perceptual: vec![PerceptualAlgorithm::Average, PerceptualAlgorithm::Difference],
            resolution: Resolution::default(),
        }
    }
}

/// Service for computing the digests of a file
#[derive(Debug, Clone)]
pub struct HashService {
    options: HashOptions,
}

impl HashService {
    pub fn new(options: HashOptions) -> Result<Self, HashError> {
        options.resolution.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &HashOptions {
        &self.options
    }

    /// Compute the exact digest, and the perceptual ones when `want_perceptual` is set.
    pub fn hash_file(&self, file_path: &Path, want_perceptual: bool) -> Result<DigestSet, HashError> {
        ensure_file(file_path)?;

        let exact = self.compute_content_hash(file_path)?;
        let mut digests = DigestSet::exact_only(exact);

        if want_perceptual && !self.options.perceptual.is_empty() {
            digests.perceptual = self.compute_perceptual_hashes(file_path)?;
        }

        Ok(digests)
    }

    /// Like [`hash_file`](Self::hash_file), but a file that is not a decodable
    /// image still gets its exact digest.
    pub fn hash_file_lenient(
        &self,
        file_path: &Path,
        want_perceptual: bool,
    ) -> Result<DigestSet, HashError> {
        match self.hash_file(file_path, want_perceptual) {
            Err(HashError::UnsupportedFormat { path, reason }) => {
                log::debug!("{}: exact digest only ({})", path.display(), reason);
                self.hash_file(file_path, false)
            }
            other => other,
        }
    }

    /// Compute BLAKE3 content hash by streaming the file once
    pub fn compute_content_hash(&self, file_path: &Path) -> Result<ExactHash, HashError> {
        let file = File::open(file_path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0; 8192];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(ExactHash(hasher.finalize().to_hex().to_string()))
    }

    /// Image type is sniffed from the file header; the extension is ignored.
    pub fn compute_perceptual_hashes(
        &self,
        file_path: &Path,
    ) -> Result<BTreeMap<PerceptualAlgorithm, BitVector>, HashError> {
        let unsupported = |reason: String| HashError::UnsupportedFormat {
            path: file_path.to_path_buf(),
            reason,
        };

        let reader =
            ImageReader::new(BufReader::new(File::open(file_path)?)).with_guessed_format()?;
        if reader.format().is_none() {
            return Err(unsupported("unknown image header".to_string()));
        }
        let image = reader.decode().map_err(|e| unsupported(e.to_string()))?;

        let side = self
            .options
            .resolution
            .hash_side(image.width(), image.height())?;

        let mut hashes = BTreeMap::new();
        for algorithm in &self.options.perceptual {
            let hash = algorithm.hasher(side).hash_image(&image);
            hashes.insert(*algorithm, BitVector::from_bytes(hash.as_bytes()));
        }

        Ok(hashes)
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self {
            options: HashOptions::default(),
        }
    }
}

fn ensure_file(file_path: &Path) -> Result<(), HashError> {
    if !file_path.exists() {
        return Err(HashError::NotFound {
            path: file_path.to_path_buf(),
        });
    }

    if !file_path.is_file() {
        return Err(HashError::NotAFile {
            path: file_path.to_path_buf(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_gradient_png, write_stripes_png};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compute_content_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.txt");
        fs::write(&file_path, b"Hello, World!").unwrap();

        let hash_service = HashService::default();
        let hash = hash_service.compute_content_hash(&file_path).unwrap();
        let hash2 = hash_service.compute_content_hash(&file_path).unwrap();
        assert_eq!(hash, hash2);

        // 64 hex characters for BLAKE3
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identical_files_same_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("file1.txt");
        let file2 = temp_dir.path().join("file2.txt");
        fs::write(&file1, b"Identical content").unwrap();
        fs::write(&file2, b"Identical content").unwrap();

        let hash_service = HashService::default();
        let a = hash_service.hash_file(&file1, false).unwrap();
        let b = hash_service.hash_file(&file2, false).unwrap();

        assert_eq!(a.exact, b.exact);
        assert!(a.perceptual.is_empty());
    }

    #[test]
    fn test_missing_file_and_directory_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let hash_service = HashService::default();

        let missing = hash_service.hash_file(&temp_dir.path().join("nope.jpg"), false);
        assert!(matches!(missing, Err(HashError::NotFound { .. })));

        let directory = hash_service.hash_file(temp_dir.path(), false);
        assert!(matches!(directory, Err(HashError::NotAFile { .. })));
    }

    #[test]
    fn test_perceptual_hash_sniffs_header_not_extension() {
        let temp_dir = TempDir::new().unwrap();
        let fake = temp_dir.path().join("holiday.jpg");
        fs::write(&fake, b"definitely not a jpeg").unwrap();

        let hash_service = HashService::default();
        let result = hash_service.hash_file(&fake, true);
        assert!(matches!(result, Err(HashError::UnsupportedFormat { .. })));

        // Lenient hashing keeps the exact digest
        let lenient = hash_service.hash_file_lenient(&fake, true).unwrap();
        assert!(lenient.perceptual.is_empty());
        assert!(!lenient.exact.is_empty());

        // A png without extension is still an image
        let real = temp_dir.path().join("no_extension");
        write_gradient_png(&real, 0);
        let digests = hash_service.hash_file(&real, true).unwrap();
        assert_eq!(digests.perceptual.len(), 2);
    }

    #[test]
    fn test_perceptual_hash_width_follows_resolution() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("image.png");
        write_stripes_png(&image);

        let options = HashOptions {
            perceptual: vec![
                PerceptualAlgorithm::Average,
                PerceptualAlgorithm::Difference,
                PerceptualAlgorithm::Perceptual,
                PerceptualAlgorithm::Block,
            ],
            resolution: Resolution::Fixed(2),
        };
        let hash_service = HashService::new(options).unwrap();
        let digests = hash_service.hash_file(&image, true).unwrap();

        assert_eq!(digests.perceptual.len(), 4);
        for bits in digests.perceptual.values() {
            assert_eq!(bits.bit_len(), 64);
        }

        let options = HashOptions {
            perceptual: vec![PerceptualAlgorithm::Average],
            resolution: Resolution::Fixed(4),
        };
        let hash_service = HashService::new(options).unwrap();
        let digests = hash_service.hash_file(&image, true).unwrap();
        assert_eq!(digests.perceptual[&PerceptualAlgorithm::Average].bit_len(), 256);
    }

    #[test]
    fn test_zero_resolution_is_rejected() {
        let options = HashOptions {
            resolution: Resolution::Fixed(0),
            ..HashOptions::default()
        };
        assert!(matches!(
            HashService::new(options),
            Err(HashError::InvalidResolution { .. })
        ));
        assert!("0".parse::<Resolution>().is_err());
        assert!("-3".parse::<Resolution>().is_err());
        assert_eq!("auto".parse::<Resolution>().unwrap(), Resolution::Auto);
        assert_eq!("3".parse::<Resolution>().unwrap(), Resolution::Fixed(3));
    }

    #[test]
    fn test_oversized_resolution_is_rejected() {
        assert!("4294967295".parse::<Resolution>().is_err());
        assert!("33".parse::<Resolution>().is_err());
        assert_eq!("32".parse::<Resolution>().unwrap(), Resolution::Fixed(32));

        let huge = Resolution::Fixed(u32::MAX);
        assert!(matches!(
            huge.hash_side(640, 480),
            Err(HashError::InvalidResolution { .. })
        ));
        let options = HashOptions {
            resolution: huge,
            ..HashOptions::default()
        };
        assert!(HashService::new(options).is_err());
    }

    #[test]
    fn test_auto_resolution_tiers() {
        let auto = Resolution::Auto;
        assert_eq!(auto.factor(200, 200).unwrap(), 1);
        assert_eq!(auto.factor(1024, 768).unwrap(), 2);
        assert_eq!(auto.factor(3000, 2000).unwrap(), 4);
        assert_eq!(auto.factor(4000, 3500).unwrap(), 8);
        assert_eq!(auto.factor(6000, 4000).unwrap(), 16);
        assert_eq!(auto.factor(8000, 6000).unwrap(), 32);
        assert_eq!(auto.hash_side(8000, 6000).unwrap(), 128);
    }

    #[test]
    fn test_bit_vector_hex_and_distance() {
        let a: BitVector = "ff00".parse().unwrap();
        let b: BitVector = "0f01".parse().unwrap();
        assert_eq!(a.to_hex(), "ff00");
        assert_eq!(a.distance(&b), Some(5));
        assert_eq!(a.distance(&a), Some(0));

        let wider: BitVector = "ff0000".parse().unwrap();
        assert_eq!(a.distance(&wider), None);

        assert_eq!("abc".parse::<BitVector>(), Err(ParseBitVectorError::OddLength));
        assert_eq!(
            "zz".parse::<BitVector>(),
            Err(ParseBitVectorError::InvalidDigit('z'))
        );
        assert!("".parse::<BitVector>().unwrap().is_empty());
    }

    #[test]
    fn test_digest_set_json_shape() {
        let digests = DigestSet::exact_only(ExactHash("abc123".to_string()))
            .with_perceptual(PerceptualAlgorithm::Average, "ff00".parse().unwrap());

        let json = serde_json::to_value(&digests).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "exact": "abc123", "average": "ff00" })
        );

        let back: DigestSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, digests);
    }
}
