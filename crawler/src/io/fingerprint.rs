//! Perceptual fingerprints for screenshots.

use anyhow::{Context, Result};
use image::ImageFormat;
use image_hasher::{HashAlg, Hasher, HasherConfig};

/// Screenshot bytes -> fixed-width lowercase hex fingerprint.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, png: &[u8]) -> Result<String>;
}

/// 64-bit DCT mean hash, rendered as 16 hex characters.
///
/// The DCT pass discards high-frequency detail, so a blinking cursor or a
/// clock tick in the status bar leaves the hash unchanged or within a few bits.
pub struct PerceptualHasher {
    hasher: Hasher,
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .hash_size(8, 8)
            .to_hasher();
        Self { hasher }
    }
}

impl Fingerprinter for PerceptualHasher {
    fn fingerprint(&self, png: &[u8]) -> Result<String> {
        let img = image::load_from_memory_with_format(png, ImageFormat::Png)
            .context("decode screenshot png")?;
        let hash = self.hasher.hash_image(&img);
        Ok(hex::encode(hash.as_bytes()))
    }
}
