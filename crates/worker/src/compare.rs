//! Screenshot comparison.
//!
//! The default comparator behind the pluggable comparison seam: a sha256
//! fast path, a per-channel tolerance to absorb anti-aliasing and
//! compression noise, and a diff image with differing pixels marked red
//! over a dimmed copy of the actual screenshot.

use image::{GenericImageView, Pixel, RgbaImage};
use sha2::{Digest, Sha256};
use specter_common::{Error, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Result of comparing an actual screenshot against its expected image
#[derive(Debug)]
pub struct CompareOutcome {
    /// Whether the images match within the threshold
    pub matches: bool,

    /// Percentage of pixels that differ
    pub diff_percent: f64,

    pub diff_pixels: u64,
    pub total_pixels: u64,

    /// Rendered diff; present whenever any pixel differs
    pub diff_image: Option<RgbaImage>,
}

/// Pixel comparator with fixed tolerance and threshold
pub struct Comparator {
    /// Per-channel color tolerance
    tolerance: u8,

    /// Percentage of differing pixels tolerated before the verdict flips
    threshold: f64,
}

impl Comparator {
    pub fn new(tolerance: u8, threshold: f64) -> Self {
        Self { tolerance, threshold }
    }

    /// Compare two on-disk images.
    pub fn compare_files(&self, expected: &Path, actual: &Path) -> Result<CompareOutcome> {
        // Identical files match without decoding
        if hash_file(expected)? == hash_file(actual)? {
            debug!("screenshots match exactly (same hash)");
            let (width, height) = image::image_dimensions(actual)
                .map_err(|e| Error::Compare(e.to_string()))?;
            return Ok(CompareOutcome {
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: u64::from(width) * u64::from(height),
                diff_image: None,
            });
        }

        let expected_img = image::open(expected).map_err(|e| {
            Error::Compare(format!("cannot read {}: {}", expected.display(), e))
        })?;
        let actual_img = image::open(actual).map_err(|e| {
            Error::Compare(format!("cannot read {}: {}", actual.display(), e))
        })?;

        if expected_img.dimensions() != actual_img.dimensions() {
            warn!(
                "screenshot dimensions differ: expected {:?}, actual {:?}",
                expected_img.dimensions(),
                actual_img.dimensions()
            );
        }

        let expected_rgba = expected_img.to_rgba8();
        let actual_rgba = actual_img.to_rgba8();
        let (width, height) = actual_img.dimensions();

        // Pixels outside the overlapping region always count as different
        let overlap_w = width.min(expected_img.width());
        let overlap_h = height.min(expected_img.height());
        let total_pixels = u64::from(width.max(expected_img.width()))
            * u64::from(height.max(expected_img.height()));

        let mut diff_img = RgbaImage::new(width, height);
        let mut diff_pixels = total_pixels - u64::from(overlap_w) * u64::from(overlap_h);

        for y in 0..height {
            for x in 0..width {
                let actual_pixel = actual_rgba.get_pixel(x, y);
                let in_overlap = x < overlap_w && y < overlap_h;
                let differs = !in_overlap
                    || self.pixels_differ(expected_rgba.get_pixel(x, y), actual_pixel);
                if differs {
                    if in_overlap {
                        diff_pixels += 1;
                    }
                    diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
                } else {
                    let channels = actual_pixel.channels();
                    diff_img.put_pixel(
                        x,
                        y,
                        image::Rgba([channels[0] / 2, channels[1] / 2, channels[2] / 2, 128]),
                    );
                }
            }
        }

        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            (diff_pixels as f64 / total_pixels as f64) * 100.0
        };
        let matches = diff_percent <= self.threshold;

        Ok(CompareOutcome {
            matches,
            diff_percent,
            diff_pixels,
            total_pixels,
            diff_image: (diff_pixels > 0).then_some(diff_img),
        })
    }

    fn pixels_differ(&self, a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
        let a = a.channels();
        let b = b.channels();
        for i in 0..4 {
            if (i32::from(a[i]) - i32::from(b[i])).abs() > i32::from(self.tolerance) {
                return true;
            }
        }
        false
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_image(dir: &Path, name: &str, width: u32, height: u32, color: [u8; 4]) -> PathBuf {
        let img = RgbaImage::from_pixel(width, height, image::Rgba(color));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_identical_images_match() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", 16, 16, [10, 20, 30, 255]);
        let b = write_image(dir.path(), "b.png", 16, 16, [10, 20, 30, 255]);

        let outcome = Comparator::new(5, 0.5).compare_files(&a, &b).unwrap();
        assert!(outcome.matches);
        assert_eq!(outcome.diff_pixels, 0);
        assert!(outcome.diff_image.is_none());
    }

    #[test]
    fn test_within_tolerance_matches() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", 16, 16, [10, 20, 30, 255]);
        let b = write_image(dir.path(), "b.png", 16, 16, [12, 22, 28, 255]);

        let outcome = Comparator::new(5, 0.0).compare_files(&a, &b).unwrap();
        assert!(outcome.matches);
        assert_eq!(outcome.diff_pixels, 0);
    }

    #[test]
    fn test_large_difference_fails_with_diff_image() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", 16, 16, [0, 0, 0, 255]);
        let b = write_image(dir.path(), "b.png", 16, 16, [255, 255, 255, 255]);

        let outcome = Comparator::new(5, 0.5).compare_files(&a, &b).unwrap();
        assert!(!outcome.matches);
        assert_eq!(outcome.diff_pixels, 16 * 16);
        assert!((outcome.diff_percent - 100.0).abs() < f64::EPSILON);

        let diff = outcome.diff_image.unwrap();
        assert_eq!(diff.get_pixel(0, 0), &image::Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_dimension_mismatch_counts_missing_area() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", 16, 16, [10, 20, 30, 255]);
        let b = write_image(dir.path(), "b.png", 16, 8, [10, 20, 30, 255]);

        let outcome = Comparator::new(5, 0.5).compare_files(&a, &b).unwrap();
        assert!(!outcome.matches);
        assert_eq!(outcome.total_pixels, 16 * 16);
        assert_eq!(outcome.diff_pixels, 16 * 8);
    }
}
