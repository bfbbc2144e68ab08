use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Default dHash grid size, giving a 64-bit hash.
pub const DEFAULT_DHASH_SIZE: u32 = 8;

/// Largest accepted dHash grid size, a 4096-bit hash.
pub const MAX_DHASH_SIZE: u32 = 64;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid dHash size: {size}")]
    InvalidSize { size: u32 },

    #[error("Invalid digest {value:?}: {message}")]
    InvalidDigest { value: String, message: String },
}

/// Computes content-addressed and perceptual digests from file bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Compute the SHA-256 digest of a file as 64 lowercase hex characters.
    /// The file is streamed, never loaded whole.
    pub fn calc_sha256(&self, file_path: &Path) -> Result<String, HashError> {
        let file = File::open(file_path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buffer = [0; 8192];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let result = hasher.finalize();
        Ok(format!("{:x}", result))
    }

    /// Compute a difference hash of an image file.
    ///
    /// The image is resized to `(size + 1) x size` ignoring aspect ratio and
    /// converted to luminance. Each row yields `size` bits, one per adjacent
    /// horizontal pair, set when the right pixel is brighter than the left.
    /// Bits are concatenated row-major and packed four at a time into hex
    /// nibbles, so the default size of 8 gives 16 hex characters.
    pub fn calc_dhash(&self, file_path: &Path, size: u32) -> Result<String, HashError> {
        if size == 0 || size > MAX_DHASH_SIZE {
            return Err(HashError::InvalidSize { size });
        }

        let img = image::open(file_path)?;
        let gray = img
            .resize_exact(size + 1, size, FilterType::Lanczos3)
            .to_luma8();

        let luminance = |x: u32, y: u32| gray.get_pixel_checked(x, y).map_or(0, |p| p.0[0]);

        let mut bits = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                bits.push(luminance(x + 1, y) > luminance(x, y));
            }
        }

        Ok(bits_to_hex(&bits))
    }
}

/// Pack a bit string into hex nibbles, most significant bit first. A trailing
/// partial nibble is padded with zero bits.
pub fn bits_to_hex(bits: &[bool]) -> String {
    bits.chunks(4)
        .map(|chunk| {
            let nibble = chunk
                .iter()
                .enumerate()
                .fold(0u32, |acc, (i, &bit)| acc | ((bit as u32) << (3 - i)));
            // nibble < 16
            std::char::from_digit(nibble, 16).unwrap_or('0')
        })
        .collect()
}

/// Number of differing bits between two equal-length hex digests.
pub fn hamming_distance(a: &str, b: &str) -> Result<u32, HashError> {
    if a.len() != b.len() {
        return Err(HashError::InvalidDigest {
            value: b.to_string(),
            message: format!("length {} does not match {}", b.len(), a.len()),
        });
    }

    a.chars().zip(b.chars()).try_fold(0u32, |acc, (ca, cb)| {
        let na = nibble(ca, a)?;
        let nb = nibble(cb, b)?;
        Ok(acc + (na ^ nb).count_ones())
    })
}

fn nibble(c: char, value: &str) -> Result<u32, HashError> {
    c.to_digit(16).ok_or_else(|| HashError::InvalidDigest {
        value: value.to_string(),
        message: format!("'{}' is not a hex digit", c),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    const BANDS: [u8; 9] = [10, 200, 50, 180, 90, 250, 30, 120, 220];

    /// Nine vertical bands of alternating brightness with a slight vertical
    /// gradient, so the dHash gradients are strong and stable.
    pub(crate) fn banded_image(width: u32, height: u32, invert: bool) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let band = (x * BANDS.len() as u32 / width) as usize;
            let base = BANDS[band].saturating_sub((y * 5 / height) as u8);
            let v = if invert { 255 - base } else { base };
            Rgb([v, v, v.saturating_sub(5)])
        })
    }

    #[test]
    fn test_sha256_known_value() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("hello.txt");
        fs::write(&file_path, b"hello world").unwrap();

        let hash = HashService::new().calc_sha256(&file_path).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_identical_files_same_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("file1.bin");
        let file2 = temp_dir.path().join("file2.bin");

        // Larger than the read buffer so several chunks are folded in.
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&file1, &content).unwrap();
        fs::write(&file2, &content).unwrap();

        let service = HashService::new();
        let hash1 = service.calc_sha256(&file1).unwrap();
        let hash2 = service.calc_sha256(&file2).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_different_files_different_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("a.txt");
        let file2 = temp_dir.path().join("b.txt");
        fs::write(&file1, b"Content A").unwrap();
        fs::write(&file2, b"Content B").unwrap();

        let service = HashService::new();
        assert_ne!(
            service.calc_sha256(&file1).unwrap(),
            service.calc_sha256(&file2).unwrap()
        );
    }

    #[test]
    fn test_sha256_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = HashService::new().calc_sha256(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(HashError::Io(_))));
    }

    #[test]
    fn test_dhash_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bands.png");
        banded_image(180, 120, false).save(&path).unwrap();

        let service = HashService::new();
        let first = service.calc_dhash(&path, DEFAULT_DHASH_SIZE).unwrap();
        let second = service.calc_dhash(&path, DEFAULT_DHASH_SIZE).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_dhash_survives_recompression() {
        let temp_dir = TempDir::new().unwrap();
        let png_path = temp_dir.path().join("original.png");
        let jpg_path = temp_dir.path().join("recompressed.jpg");

        let img = banded_image(180, 120, false);
        img.save(&png_path).unwrap();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 60)
            .encode_image(&img)
            .unwrap();
        fs::write(&jpg_path, jpeg).unwrap();

        let service = HashService::new();
        let original = service.calc_dhash(&png_path, DEFAULT_DHASH_SIZE).unwrap();
        let recompressed = service.calc_dhash(&jpg_path, DEFAULT_DHASH_SIZE).unwrap();

        assert!(hamming_distance(&original, &recompressed).unwrap() <= 4);
    }

    #[test]
    fn test_dhash_distinguishes_inverted_image() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.png");
        let b = temp_dir.path().join("b.png");
        banded_image(180, 120, false).save(&a).unwrap();
        banded_image(180, 120, true).save(&b).unwrap();

        let service = HashService::new();
        let ha = service.calc_dhash(&a, DEFAULT_DHASH_SIZE).unwrap();
        let hb = service.calc_dhash(&b, DEFAULT_DHASH_SIZE).unwrap();

        assert!(hamming_distance(&ha, &hb).unwrap() > 32);
    }

    #[test]
    fn test_dhash_flat_image_is_all_zero() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("flat.png");
        ImageBuffer::from_pixel(40, 40, Rgb([128u8, 128, 128]))
            .save(&path)
            .unwrap();

        let hash = HashService::new().calc_dhash(&path, 4).unwrap();
        assert_eq!(hash, "0000");
    }

    #[test]
    fn test_dhash_rejects_corrupt_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.png");
        fs::write(&path, b"not an image").unwrap();

        let result = HashService::new().calc_dhash(&path, DEFAULT_DHASH_SIZE);
        assert!(matches!(result, Err(HashError::Image(_))));
    }

    #[test]
    fn test_dhash_rejects_out_of_range_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("flat.png");
        ImageBuffer::from_pixel(8, 8, Rgb([128u8, 128, 128]))
            .save(&path)
            .unwrap();

        let hash = HashService::new();
        for size in [0, MAX_DHASH_SIZE + 1, u32::MAX] {
            assert!(matches!(
                hash.calc_dhash(&path, size),
                Err(HashError::InvalidSize { size: s }) if s == size
            ));
        }
    }

    #[test]
    fn test_bits_to_hex_packs_msb_first() {
        let bits = [true, false, false, false, false, false, false, true, true];
        assert_eq!(bits_to_hex(&bits), "818");
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance("00ff", "00ff").unwrap(), 0);
        assert_eq!(hamming_distance("0000", "000f").unwrap(), 4);
        assert_eq!(hamming_distance("f0f0", "0f0f").unwrap(), 16);
        assert!(hamming_distance("00", "000").is_err());
        assert!(hamming_distance("zz", "00").is_err());
    }
}
