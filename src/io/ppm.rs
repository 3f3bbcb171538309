//! PPM/PGM codec
//!
//! Binary netpbm maps: pixmaps for RGB, graymaps for luminance, 8 or
//! 16-bit. No alpha in the format, so negotiation drops it.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};

use crate::core::workers::Workers;
use crate::error::Result;
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::IoPlugin;
use crate::io::convert;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new(
        "ppm",
        &["ppm", "pgm", "pnm"],
        Arc::new(PpmCodec),
        workers,
    ))
}

pub struct PpmCodec;

impl Codec for PpmCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        convert::decode_file(path)
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let dynamic = convert::to_dynamic(image)?;
        let subtype = match image.info().pixel_type.channel_count() {
            1 => PnmSubtype::Graymap(SampleEncoding::Binary),
            _ => PnmSubtype::Pixmap(SampleEncoding::Binary),
        };
        let file = File::create(path)?;
        let encoder = PnmEncoder::new(BufWriter::new(file)).with_subtype(subtype);
        dynamic.write_with_encoder(encoder)?;
        Ok(())
    }

    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo> {
        use PixelType::*;
        let pixel_type = match info.pixel_type {
            LU8 | RgbU8 | LU16 | RgbU16 => info.pixel_type,
            LaU8 => LU8,
            LaU16 | LaU32 | LaF16 | LaF32 => LU16,
            LU32 | LF16 | LF32 => LU16,
            RgbaU8 => RgbU8,
            _ => RgbU16,
        };
        Some(ImageInfo::new(info.width, info.height, pixel_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelBuffer;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("reela_ppm_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_round_trip_rgb8() {
        let dir = temp_dir();
        let path = dir.join("t.ppm").to_string_lossy().into_owned();

        let raw: Vec<u8> = (0..6 * 4 * 3).map(|i| (i * 11 % 256) as u8).collect();
        let image = Image::from_buffer(
            ImageInfo::new(6, 4, PixelType::RgbU8),
            PixelBuffer::U8(raw.clone()),
        );

        let codec = PpmCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbU8);
        assert_eq!(decoded.buffer().bytes(), raw.as_slice());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_round_trip_graymap() {
        let dir = temp_dir();
        let path = dir.join("g.pgm").to_string_lossy().into_owned();

        let raw: Vec<u8> = vec![0, 64, 128, 255];
        let image = Image::from_buffer(
            ImageInfo::new(2, 2, PixelType::LU8),
            PixelBuffer::U8(raw.clone()),
        );

        let codec = PpmCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::LU8);
        assert_eq!(decoded.buffer().bytes(), raw.as_slice());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_negotiation_drops_alpha() {
        let codec = PpmCodec;
        let rgba = ImageInfo::new(4, 4, PixelType::RgbaU8);
        assert_eq!(codec.write_info(&rgba).unwrap().pixel_type, PixelType::RgbU8);
        let half_float = ImageInfo::new(4, 4, PixelType::RgbF16);
        assert_eq!(codec.write_info(&half_float).unwrap().pixel_type, PixelType::RgbU16);
    }
}
