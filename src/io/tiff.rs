//! TIFF codec
//!
//! Lossless 8/16-bit integer writes; reads whatever the decoder hands
//! back, including float scanlines (surfaced as F32 via the crate).

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use image::codecs::tiff::TiffEncoder;

use crate::core::workers::Workers;
use crate::error::Result;
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::IoPlugin;
use crate::io::convert;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new(
        "tiff",
        &["tif", "tiff"],
        Arc::new(TiffCodec),
        workers,
    ))
}

pub struct TiffCodec;

impl Codec for TiffCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        convert::decode_file(path)
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let dynamic = convert::to_dynamic(image)?;
        let file = File::create(path)?;
        dynamic.write_with_encoder(TiffEncoder::new(BufWriter::new(file)))?;
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

    #[test]
    fn test_round_trip_rgb16() {
        let dir = std::env::temp_dir().join(format!("reela_tif_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.tif").to_string_lossy().into_owned();

        let raw: Vec<u16> = (0..5 * 2 * 3).map(|i| (i * 4099) as u16).collect();
        let image = Image::from_buffer(
            ImageInfo::new(5, 2, PixelType::RgbU16),
            PixelBuffer::U16(raw.clone()),
        );

        let codec = TiffCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbU16);
        match decoded.buffer() {
            PixelBuffer::U16(v) => assert_eq!(v, &raw),
            _ => panic!("expected 16-bit storage"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
