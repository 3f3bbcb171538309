//! OpenEXR codec
//!
//! Scanline RGB/RGBA EXR through the `image` crate's exr backend. The
//! decoder surfaces everything as 32-bit float; half-float inputs
//! negotiate up to F32 on the write side.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use image::codecs::openexr::OpenExrEncoder;

use crate::core::workers::Workers;
use crate::error::Result;
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::IoPlugin;
use crate::io::convert;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new("exr", &["exr"], Arc::new(ExrCodec), workers))
}

pub struct ExrCodec;

impl Codec for ExrCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        convert::decode_file(path)
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let dynamic = convert::to_dynamic(image)?;
        let file = File::create(path)?;
        dynamic.write_with_encoder(OpenExrEncoder::new(BufWriter::new(file)))?;
        Ok(())
    }

    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo> {
        // the backend writes f32 scanlines, rgb or rgba only
        let pixel_type = if info.pixel_type.has_alpha() {
            PixelType::RgbaF32
        } else {
            PixelType::RgbF32
        };
        Some(ImageInfo::new(info.width, info.height, pixel_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelBuffer;

    #[test]
    fn test_round_trip_rgba_f32() {
        let dir = std::env::temp_dir().join(format!("reela_exr_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.exr").to_string_lossy().into_owned();

        let raw: Vec<f32> = (0..4 * 2 * 4).map(|i| i as f32 * 0.125).collect();
        let image = Image::from_buffer(
            ImageInfo::new(4, 2, PixelType::RgbaF32),
            PixelBuffer::F32(raw.clone()),
        );

        let codec = ExrCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbaF32);
        match decoded.buffer() {
            PixelBuffer::F32(v) => assert_eq!(v, &raw),
            _ => panic!("expected f32 storage"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_negotiation_promotes_to_float() {
        let codec = ExrCodec;
        let u8_rgb = ImageInfo::new(4, 4, PixelType::RgbU8);
        assert_eq!(codec.write_info(&u8_rgb).unwrap().pixel_type, PixelType::RgbF32);
        let half_rgba = ImageInfo::new(4, 4, PixelType::RgbaF16);
        assert_eq!(codec.write_info(&half_rgba).unwrap().pixel_type, PixelType::RgbaF32);
        let la = ImageInfo::new(4, 4, PixelType::LaU16);
        assert_eq!(codec.write_info(&la).unwrap().pixel_type, PixelType::RgbaF32);
    }
}
