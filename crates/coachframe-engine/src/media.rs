use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use sha2::{Digest, Sha256};

/// An image ready to be embedded in a remote request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data_base64: String,
}

impl EncodedImage {
    pub fn from_bytes(bytes: &[u8], mime_type: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data_base64: BASE64.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

/// Raw image bytes as returned by a generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Decodes `path`, flattens transparency onto white, fits it inside
/// `max_dim` and re-encodes as JPEG. Files the decoder cannot read are sent
/// as-is with a mime type guessed from the extension.
pub fn encode_image(path: &Path, max_dim: u32) -> Result<EncodedImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let Ok(decoded) = image::load_from_memory(&bytes) else {
        return Ok(EncodedImage::from_bytes(&bytes, guess_image_mime(path)));
    };
    let bound = max_dim.max(128);
    let fitted = if decoded.width() > bound || decoded.height() > bound {
        decoded.resize(bound, bound, FilterType::Triangle)
    } else {
        decoded
    };
    let mut jpeg = Vec::new();
    let written =
        JpegEncoder::new_with_quality(&mut jpeg, 90).encode_image(&flatten_on_white(&fitted));
    if written.is_err() {
        return Ok(EncodedImage::from_bytes(&bytes, guess_image_mime(path)));
    }
    Ok(EncodedImage::from_bytes(&jpeg, "image/jpeg"))
}

/// Composites any alpha channel over white; JPEG has no transparency.
fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let over = |channel: u8| {
            let alpha = u32::from(a);
            ((u32::from(channel) * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        Rgb([over(r), over(g), over(b)])
    })
}

pub fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn file_sha256(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|bytes| sha256_hex(&bytes))
}

/// Writes `image` to `path` as PNG regardless of the format it arrived in, so a
/// shot's image file name never changes between regenerations.
pub fn store_as_png(image: &ImageBytes, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match image::load_from_memory(&image.bytes) {
        Ok(decoded) => decoded
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("failed to save {}", path.display())),
        Err(_) => fs::write(path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display())),
    }
}

/// Solid-colour PNG whose colour is derived from `prompt`; used by the dryrun
/// generator.
pub fn render_placeholder(prompt: &str, width: u32, height: u32) -> Result<ImageBytes> {
    let digest = Sha256::digest(prompt.as_bytes());
    let canvas = RgbImage::from_pixel(
        width.max(1),
        height.max(1),
        Rgb([digest[0], digest[1], digest[2]]),
    );
    let mut bytes = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut bytes, image::ImageFormat::Png)
        .context("failed encoding placeholder image")?;
    Ok(ImageBytes {
        bytes: bytes.into_inner(),
        mime_type: Some("image/png".to_string()),
    })
}

/// Encoded anchor images keyed by their path, shared by every shot of a run.
#[derive(Debug, Default)]
pub struct AnchorCache {
    max_dim: u32,
    entries: HashMap<String, Arc<EncodedImage>>,
}

impl AnchorCache {
    pub fn new(max_dim: u32) -> Self {
        Self {
            max_dim,
            entries: HashMap::new(),
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<Arc<EncodedImage>> {
        let key = path.to_string_lossy().to_string();
        if let Some(cached) = self.entries.get(&key) {
            return Ok(Arc::clone(cached));
        }
        let encoded = Arc::new(encode_image(path, self.max_dim)?);
        self.entries.insert(key, Arc::clone(&encoded));
        Ok(encoded)
    }

    pub fn max_dim(&self) -> u32 {
        self.max_dim
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path.to_string_lossy().as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
