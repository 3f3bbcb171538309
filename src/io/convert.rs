//! image crate bridging
//!
//! Codec modules built on the `image` crate share these two mappings:
//! `DynamicImage` to our typed [`Image`] preserving channel depth, and
//! back again for encoding. Formats the crate cannot express directly
//! (packed 10-bit, f16) never reach `to_dynamic`; writer negotiation
//! converts them first.

use image::{DynamicImage, ImageBuffer};

use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo, PixelBuffer, PixelType};

pub(crate) fn decode_file(path: &str) -> Result<Image> {
    Ok(from_dynamic(image::open(path)?))
}

pub(crate) fn from_dynamic(dynamic: DynamicImage) -> Image {
    let width = dynamic.width() as usize;
    let height = dynamic.height() as usize;
    let (pixel_type, buffer) = match dynamic {
        DynamicImage::ImageLuma8(b) => (PixelType::LU8, PixelBuffer::U8(b.into_raw())),
        DynamicImage::ImageLumaA8(b) => (PixelType::LaU8, PixelBuffer::U8(b.into_raw())),
        DynamicImage::ImageRgb8(b) => (PixelType::RgbU8, PixelBuffer::U8(b.into_raw())),
        DynamicImage::ImageRgba8(b) => (PixelType::RgbaU8, PixelBuffer::U8(b.into_raw())),
        DynamicImage::ImageLuma16(b) => (PixelType::LU16, PixelBuffer::U16(b.into_raw())),
        DynamicImage::ImageLumaA16(b) => (PixelType::LaU16, PixelBuffer::U16(b.into_raw())),
        DynamicImage::ImageRgb16(b) => (PixelType::RgbU16, PixelBuffer::U16(b.into_raw())),
        DynamicImage::ImageRgba16(b) => (PixelType::RgbaU16, PixelBuffer::U16(b.into_raw())),
        DynamicImage::ImageRgb32F(b) => (PixelType::RgbF32, PixelBuffer::F32(b.into_raw())),
        DynamicImage::ImageRgba32F(b) => (PixelType::RgbaF32, PixelBuffer::F32(b.into_raw())),
        other => (
            PixelType::RgbaU8,
            PixelBuffer::U8(other.to_rgba8().into_raw()),
        ),
    };
    Image::from_buffer(ImageInfo::new(width, height, pixel_type), buffer)
}

pub(crate) fn to_dynamic(image: &Image) -> Result<DynamicImage> {
    let w = image.info().width as u32;
    let h = image.info().height as u32;

    macro_rules! build {
        ($v:expr, $px:ty, $variant:ident) => {
            ImageBuffer::<$px, _>::from_raw(w, h, $v.clone())
                .map(DynamicImage::$variant)
                .ok_or_else(|| Error::InvalidArgument("pixel buffer shorter than shape".into()))
        };
    }

    match (image.info().pixel_type, image.buffer()) {
        (PixelType::LU8, PixelBuffer::U8(v)) => build!(v, image::Luma<u8>, ImageLuma8),
        (PixelType::LaU8, PixelBuffer::U8(v)) => build!(v, image::LumaA<u8>, ImageLumaA8),
        (PixelType::RgbU8, PixelBuffer::U8(v)) => build!(v, image::Rgb<u8>, ImageRgb8),
        (PixelType::RgbaU8, PixelBuffer::U8(v)) => build!(v, image::Rgba<u8>, ImageRgba8),
        (PixelType::LU16, PixelBuffer::U16(v)) => build!(v, image::Luma<u16>, ImageLuma16),
        (PixelType::LaU16, PixelBuffer::U16(v)) => build!(v, image::LumaA<u16>, ImageLumaA16),
        (PixelType::RgbU16, PixelBuffer::U16(v)) => build!(v, image::Rgb<u16>, ImageRgb16),
        (PixelType::RgbaU16, PixelBuffer::U16(v)) => build!(v, image::Rgba<u16>, ImageRgba16),
        (PixelType::RgbF32, PixelBuffer::F32(v)) => build!(v, image::Rgb<f32>, ImageRgb32F),
        (PixelType::RgbaF32, PixelBuffer::F32(v)) => build!(v, image::Rgba<f32>, ImageRgba32F),
        (pt, _) => Err(Error::InvalidArgument(format!(
            "no direct encoder form for {}",
            pt
        ))),
    }
}
