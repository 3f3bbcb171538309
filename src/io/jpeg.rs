//! JPEG codec
//!
//! Lossy 8-bit; alpha is dropped and everything deeper negotiates down.
//! Round-trips check shape only.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;

use crate::core::workers::Workers;
use crate::error::Result;
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::IoPlugin;
use crate::io::convert;
use crate::io::sequence::{Codec, SequencePlugin};

const QUALITY: u8 = 90;

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new(
        "jpeg",
        &["jpg", "jpeg"],
        Arc::new(JpegCodec),
        workers,
    ))
}

pub struct JpegCodec;

impl Codec for JpegCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        convert::decode_file(path)
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let dynamic = convert::to_dynamic(image)?;
        let file = File::create(path)?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), QUALITY);
        dynamic.write_with_encoder(encoder)?;
        Ok(())
    }

    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo> {
        // baseline JPEG: 8-bit, no alpha
        let pixel_type = match info.pixel_type.channel_count() {
            1 | 2 => PixelType::LU8,
            _ => PixelType::RgbU8,
        };
        Some(ImageInfo::new(info.width, info.height, pixel_type))
    }
}
