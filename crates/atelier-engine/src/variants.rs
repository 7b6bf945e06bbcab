//! Downscaled desktop/mobile/thumbnail renditions of a generated image.

use std::io::Cursor;
use std::thread;

use atelier_contracts::request::OutputFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::VariantError;
use crate::http::guess_mime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantSpec {
    pub name: &'static str,
    pub max_width: u32,
    pub quality: f32,
}

pub const DESKTOP: VariantSpec = VariantSpec {
    name: "desktop",
    max_width: 1024,
    quality: 0.8,
};
pub const MOBILE: VariantSpec = VariantSpec {
    name: "mobile",
    max_width: 640,
    quality: 0.7,
};
pub const THUMBNAIL: VariantSpec = VariantSpec {
    name: "thumbnail",
    max_width: 300,
    quality: 0.6,
};

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantBundle {
    pub original: EncodedImage,
    pub desktop: EncodedImage,
    pub mobile: EncodedImage,
    pub thumbnail: EncodedImage,
}

/// Target size for a tier: width capped at `max_width`, aspect ratio kept,
/// never larger than the source.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width == 0 || height == 0 || width <= max_width {
        return (width, height);
    }
    let scale = max_width as f64 / width as f64;
    let scaled_height = (height as f64 * scale).round().max(1.0) as u32;
    (max_width, scaled_height)
}

/// Decodes `source` and re-encodes the three tiers concurrently in `format`
/// (`webp`, `png` or `jpg`).
pub fn generate_variants(source: &[u8], format: &str) -> Result<VariantBundle, VariantError> {
    let format: OutputFormat = format
        .parse()
        .map_err(|_| VariantError::UnsupportedFormat(format.trim().to_string()))?;
    let decoded =
        image::load_from_memory(source).map_err(|err| VariantError::Decode(err.to_string()))?;
    let original = EncodedImage {
        bytes: source.to_vec(),
        width: decoded.width(),
        height: decoded.height(),
        mime_type: guess_mime(source).to_string(),
    };

    let (desktop, mobile, thumbnail) = thread::scope(|scope| {
        let desktop = scope.spawn(|| render_variant(&decoded, DESKTOP, format));
        let mobile = scope.spawn(|| render_variant(&decoded, MOBILE, format));
        let thumbnail = scope.spawn(|| render_variant(&decoded, THUMBNAIL, format));
        (
            join_variant(desktop.join(), DESKTOP),
            join_variant(mobile.join(), MOBILE),
            join_variant(thumbnail.join(), THUMBNAIL),
        )
    });

    Ok(VariantBundle {
        original,
        desktop: desktop?,
        mobile: mobile?,
        thumbnail: thumbnail?,
    })
}

fn join_variant(
    joined: thread::Result<Result<EncodedImage, VariantError>>,
    spec: VariantSpec,
) -> Result<EncodedImage, VariantError> {
    joined.unwrap_or_else(|_| {
        Err(VariantError::Encode {
            variant: spec.name,
            message: "encoder thread panicked".to_string(),
        })
    })
}

pub fn render_variant(
    source: &DynamicImage,
    spec: VariantSpec,
    format: OutputFormat,
) -> Result<EncodedImage, VariantError> {
    let (width, height) = scaled_dimensions(source.width(), source.height(), spec.max_width);
    let resized = if (width, height) == (source.width(), source.height()) {
        source.clone()
    } else {
        source.resize_exact(width, height, FilterType::Lanczos3)
    };
    let bytes = encode(&resized, format, spec.quality).map_err(|err| VariantError::Encode {
        variant: spec.name,
        message: format!("{err:#}"),
    })?;
    Ok(EncodedImage {
        bytes,
        width,
        height,
        mime_type: format.mime_type().to_string(),
    })
}

fn encode(image: &DynamicImage, format: OutputFormat, quality: f32) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpg => {
            let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))?;
        }
        OutputFormat::Png => {
            image.write_with_encoder(PngEncoder::new(&mut buffer))?;
        }
        OutputFormat::Webp => {
            // libwebp only takes 8-bit RGB/RGBA.
            let normalized = if image.color().has_alpha() {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            let encoder = webp::Encoder::from_image(&normalized)
                .map_err(|err| anyhow::anyhow!("webp encoder rejected image: {err}"))?;
            let quality = (quality * 100.0).clamp(1.0, 100.0);
            return Ok(encoder.encode(quality).to_vec());
        }
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::test_support::png_bytes;

    #[test]
    fn scaling_never_upscales() {
        assert_eq!(scaled_dimensions(800, 600, 1024), (800, 600));
        assert_eq!(scaled_dimensions(2048, 1536, 1024), (1024, 768));
        assert_eq!(scaled_dimensions(1200, 400, 300), (300, 100));
        assert_eq!(scaled_dimensions(4000, 1, 300), (300, 1));
    }

    #[test]
    fn tiers_follow_max_widths() -> anyhow::Result<()> {
        let source = png_bytes(1200, 900);
        let bundle = generate_variants(&source, "png")?;
        assert_eq!((bundle.original.width, bundle.original.height), (1200, 900));
        assert_eq!(bundle.original.bytes, source);
        assert_eq!(bundle.original.mime_type, "image/png");
        assert_eq!((bundle.desktop.width, bundle.desktop.height), (1024, 768));
        assert_eq!((bundle.mobile.width, bundle.mobile.height), (640, 480));
        assert_eq!((bundle.thumbnail.width, bundle.thumbnail.height), (300, 225));

        let decoded = image::load_from_memory(&bundle.mobile.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
        Ok(())
    }

    #[test]
    fn small_sources_keep_their_size() -> anyhow::Result<()> {
        let bundle = generate_variants(&png_bytes(200, 100), "jpg")?;
        for variant in [&bundle.desktop, &bundle.mobile, &bundle.thumbnail] {
            assert_eq!((variant.width, variant.height), (200, 100));
            assert_eq!(variant.mime_type, "image/jpeg");
        }
        let decoded = image::load_from_memory(&bundle.thumbnail.bytes)?;
        assert_eq!(decoded.width(), 200);
        Ok(())
    }

    #[test]
    fn webp_variants_decode() -> anyhow::Result<()> {
        let bundle = generate_variants(&png_bytes(700, 350), "webp")?;
        assert_eq!(bundle.mobile.mime_type, "image/webp");
        assert_eq!(guess_mime(&bundle.mobile.bytes), "image/webp");
        assert_eq!((bundle.thumbnail.width, bundle.thumbnail.height), (300, 150));
        Ok(())
    }

    #[test]
    fn webp_quality_controls_output_size() -> anyhow::Result<()> {
        let noisy = RgbImage::from_fn(320, 240, |x, y| {
            let v = x.wrapping_mul(2654435761) ^ y.wrapping_mul(40503);
            Rgb([(v % 251) as u8, (v / 7 % 253) as u8, ((x * y) % 256) as u8])
        });
        let image = DynamicImage::ImageRgb8(noisy);
        let high = encode(&image, OutputFormat::Webp, 0.95)?;
        let low = encode(&image, OutputFormat::Webp, 0.10)?;
        assert!(low.len() < high.len(), "q10 {} vs q95 {}", low.len(), high.len());
        assert_eq!(image::load_from_memory(&low)?.width(), 320);

        let desktop = render_variant(&image, DESKTOP, OutputFormat::Webp)?;
        let thumbnail = render_variant(&image, THUMBNAIL, OutputFormat::Webp)?;
        assert!(thumbnail.bytes.len() < desktop.bytes.len());
        Ok(())
    }

    #[test]
    fn rejects_unknown_format_and_garbage_input() {
        assert!(matches!(
            generate_variants(&png_bytes(10, 10), "avif"),
            Err(VariantError::UnsupportedFormat(format)) if format == "avif"
        ));
        assert!(matches!(
            generate_variants(b"not an image", "png"),
            Err(VariantError::Decode(_))
        ));
    }
}
