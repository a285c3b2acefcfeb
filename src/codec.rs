use std::io::{Seek, Write};

use image::{DynamicImage, ImageFormat};

use crate::foundation::error::CodecError;

/// Output sink handed to [`Codec::encode`].
pub trait EncodeSink: Write + Seek {}

impl<T: Write + Seek> EncodeSink for T {}

/// The pixel codec a batch converts through.
///
/// Implementations must be shareable across worker threads. Decoding works on the full source
/// bytes; encoding streams into the output file.
pub trait Codec: Send + Sync {
    /// Extension (without the dot) given to converted files.
    fn target_extension(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError>;

    fn encode(&self, image: &DynamicImage, sink: &mut dyn EncodeSink) -> Result<(), CodecError>;
}

/// Raster formats selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RasterFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    Webp,
}

impl RasterFormat {
    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Gif => ImageFormat::Gif,
            Self::Bmp => ImageFormat::Bmp,
            Self::Tiff => ImageFormat::Tiff,
            Self::Webp => ImageFormat::WebP,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Webp => "webp",
        }
    }
}

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// [`Codec`] backed by the `image` crate.
#[derive(Clone, Debug)]
pub struct ImageCodec {
    from: RasterFormat,
    to: RasterFormat,
    jpeg_quality: u8,
}

impl ImageCodec {
    pub fn new(from: RasterFormat, to: RasterFormat) -> Self {
        Self {
            from,
            to,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    /// PNG in, JPEG out.
    pub fn png_to_jpeg() -> Self {
        Self::new(RasterFormat::Png, RasterFormat::Jpeg)
    }

    /// Quality is clamped to `1..=100`.
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn source_format(&self) -> RasterFormat {
        self.from
    }

    pub fn target_format(&self) -> RasterFormat {
        self.to
    }
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::png_to_jpeg()
    }
}

impl Codec for ImageCodec {
    fn target_extension(&self) -> &str {
        self.to.extension()
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        Ok(image::load_from_memory_with_format(
            bytes,
            self.from.image_format(),
        )?)
    }

    fn encode(
        &self,
        image: &DynamicImage,
        mut sink: &mut dyn EncodeSink,
    ) -> Result<(), CodecError> {
        match self.to {
            RasterFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut sink,
                    self.jpeg_quality,
                );
                rgb.write_with_encoder(encoder)?;
            }
            other => image.write_to(&mut sink, other.image_format())?,
        }
        Ok(())
    }
}
