//! PNG codec
//!
//! Lossless 8/16-bit integer images in every channel layout. Deeper and
//! float inputs negotiate down to 16-bit.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use image::codecs::png::PngEncoder;

use crate::core::workers::Workers;
use crate::error::Result;
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::IoPlugin;
use crate::io::convert;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new("png", &["png"], Arc::new(PngCodec), workers))
}

pub struct PngCodec;

impl Codec for PngCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        convert::decode_file(path)
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let dynamic = convert::to_dynamic(image)?;
        let file = File::create(path)?;
        dynamic.write_with_encoder(PngEncoder::new(BufWriter::new(file)))?;
        Ok(())
    }

    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo> {
        use PixelType::*;
        let pixel_type = match info.pixel_type {
            LU8 | LaU8 | RgbU8 | RgbaU8 | LU16 | LaU16 | RgbU16 | RgbaU16 => info.pixel_type,
            LU32 | LF16 | LF32 => LU16,
            LaU32 | LaF16 | LaF32 => LaU16,
            RgbU32 | RgbF16 | RgbF32 | RgbU10 => RgbU16,
            RgbaU32 | RgbaF16 | RgbaF32 => RgbaU16,
        };
        Some(ImageInfo::new(info.width, info.height, pixel_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelBuffer;

    fn temp_file(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("reela_png_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_round_trip_rgba8() {
        let path = temp_file("rt.png");
        let raw: Vec<u8> = (0..4 * 3 * 4).map(|i| (i * 7 % 256) as u8).collect();
        let image = Image::from_buffer(
            ImageInfo::new(4, 3, PixelType::RgbaU8),
            PixelBuffer::U8(raw.clone()),
        );

        let codec = PngCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbaU8);
        assert_eq!(decoded.buffer().bytes(), raw.as_slice());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_round_trip_l16() {
        let path = temp_file("gray16.png");
        let raw: Vec<u16> = vec![0, 256, 65535, 12345, 1, 40000];
        let image = Image::from_buffer(
            ImageInfo::new(3, 2, PixelType::LU16),
            PixelBuffer::U16(raw.clone()),
        );

        let codec = PngCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::LU16);
        match decoded.buffer() {
            PixelBuffer::U16(v) => assert_eq!(v, &raw),
            _ => panic!("expected 16-bit storage"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_negotiation() {
        let codec = PngCodec;
        let float = ImageInfo::new(8, 8, PixelType::RgbaF32);
        assert_eq!(codec.write_info(&float).unwrap().pixel_type, PixelType::RgbaU16);
        let packed = ImageInfo::new(8, 8, PixelType::RgbU10);
        assert_eq!(codec.write_info(&packed).unwrap().pixel_type, PixelType::RgbU16);
        let passthrough = ImageInfo::new(8, 8, PixelType::LaU8);
        assert_eq!(codec.write_info(&passthrough).unwrap().pixel_type, PixelType::LaU8);
    }
}
