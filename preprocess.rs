use crate::error::{Error, Result};
use crate::tensor::{PreprocessedTensor, TensorTracker};
use image::imageops::FilterType;
use image::{Rgb, RgbImage, RgbaImage};
use ndarray::Array4;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct SourceImage {
    pixels: RgbImage,
    encoded: Vec<u8>,
    file_name: Option<String>,
}

impl SourceImage {
    pub fn decode(encoded: Vec<u8>) -> Result<Self> {
        let decoded = image::load_from_memory(&encoded)
            .map_err(|e| Error::Decode(format!("Unsupported or corrupt image: {e}")))?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(Error::Decode("Image has no pixels".into()));
        }
        let pixels = flatten_onto_background(&decoded.to_rgba8());
        Ok(Self {
            pixels,
            encoded,
            file_name: None,
        })
    }

    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self {
            pixels,
            encoded: Vec::new(),
            file_name: None,
        }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let encoded = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string());
        let mut image = tokio::task::spawn_blocking(move || Self::decode(encoded))
            .await
            .map_err(|e| Error::Decode(format!("Decode task failed: {e}")))??;
        image.file_name = file_name;
        Ok(image)
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn upload_bytes(&self) -> Result<Vec<u8>> {
        if !self.encoded.is_empty() {
            return Ok(self.encoded.clone());
        }
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(self.pixels.clone())
            .write_to(&mut Cursor::new(&mut out), image::ImageOutputFormat::Png)?;
        Ok(out)
    }
}

fn flatten_onto_background(img: &RgbaImage) -> RgbImage {
    let mut out = RgbImage::new(img.width(), img.height());
    for (x, y, pixel) in img.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let fg = pixel[c] as u32 * alpha;
            let bg = BACKGROUND[c] as u32 * (255 - alpha);
            rgb[c] = ((fg + bg + 127) / 255) as u8;
        }
        out.put_pixel(x, y, Rgb(rgb));
    }
    out
}

// Source window left visible after cover-scaling: scale = max(S/W, S/H),
// centred, S/scale source pixels per side.
fn cover_window(width: u32, height: u32, size: u32) -> (u32, u32, u32, u32) {
    let (w, h, s) = (width as f64, height as f64, size as f64);
    let scale = (s / w).max(s / h);
    let visible = s / scale;
    let crop_w = (visible.round() as u32).clamp(1, width);
    let crop_h = (visible.round() as u32).clamp(1, height);
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;
    (x, y, crop_w, crop_h)
}

pub fn preprocess(
    image: &SourceImage,
    size: u32,
    tracker: &Arc<TensorTracker>,
) -> Result<PreprocessedTensor> {
    if size == 0 {
        return Err(Error::Config("Target size must be positive".into()));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Decode("Image has no pixels".into()));
    }
    let (x, y, w, h) = cover_window(image.width(), image.height(), size);
    let window = image::imageops::crop_imm(image.pixels(), x, y, w, h).to_image();
    let scaled = image::imageops::resize(&window, size, size, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(size, size, BACKGROUND);
    image::imageops::overlay(&mut canvas, &scaled, 0, 0);

    let input = rgb8_to_nhwc(&canvas);
    let data = Array4::from_shape_vec((1, size as usize, size as usize, 3), input)
        .map_err(|e| Error::Inference(format!("Invalid input tensor shape: {e}")))?;
    Ok(PreprocessedTensor::new(data, tracker.lease()))
}

fn rgb8_to_nhwc(img: &RgbImage) -> Vec<f32> {
    let mut input: Vec<f32> = Vec::with_capacity((img.width() * img.height() * 3) as usize);
    for pixel in img.pixels() {
        input.extend_from_slice(&[
            pixel[0] as f32 / 255.0,
            pixel[1] as f32 / 255.0,
            pixel[2] as f32 / 255.0,
        ]);
    }
    input
}
