//! DPX image codec
//!
//! Hand-rolled reader/writer for SMPTE 268M DPX, restricted to the form
//! film and VFX pipelines actually exchange: one image element, RGB
//! descriptor, 10 bits per channel filled to 32-bit words (packing
//! method A). Words map one-to-one onto [`PixelType::RgbU10`] storage.
//! Reads both byte orders; writes big-endian.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use rayon::prelude::*;

use crate::core::workers::Workers;
use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo, PixelBuffer, PixelType};
use crate::io::IoPlugin;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new("dpx", &["dpx"], Arc::new(DpxCodec), workers))
}

const MAGIC_BE: u32 = 0x5344_5058; // "SDPX"
const MAGIC_LE: u32 = 0x5850_4453; // "XPDS"
const IMAGE_INFO: usize = 768;
const ELEMENT_0: usize = IMAGE_INFO + 12;
const WRITE_DATA_OFFSET: u32 = 8192;
const DESCRIPTOR_RGB: u8 = 50;

pub struct DpxCodec;

fn ru16(data: &[u8], off: usize, be: bool) -> u16 {
    let b = [data[off], data[off + 1]];
    if be { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) }
}

fn ru32(data: &[u8], off: usize, be: bool) -> u32 {
    let b = [data[off], data[off + 1], data[off + 2], data[off + 3]];
    if be { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) }
}

impl Codec for DpxCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        let data = std::fs::read(path)?;
        if data.len() < IMAGE_INFO + 640 {
            return Err(Error::DecodeFailed(format!(
                "DPX header truncated at {} bytes",
                data.len()
            )));
        }
        let be = match u32::from_be_bytes([data[0], data[1], data[2], data[3]]) {
            MAGIC_BE => true,
            MAGIC_LE => false,
            other => {
                return Err(Error::OpenFailed(format!(
                    "not a DPX file (magic {:#010x})",
                    other
                )));
            }
        };

        let width = ru32(&data, IMAGE_INFO + 4, be) as usize;
        let height = ru32(&data, IMAGE_INFO + 8, be) as usize;
        let descriptor = data[ELEMENT_0 + 20];
        let bit_size = data[ELEMENT_0 + 23];
        let packing = ru16(&data, ELEMENT_0 + 24, be);
        let encoding = ru16(&data, ELEMENT_0 + 26, be);
        let data_offset = ru32(&data, ELEMENT_0 + 28, be) as usize;
        let eol_padding = ru32(&data, ELEMENT_0 + 32, be) as usize;

        if descriptor != DESCRIPTOR_RGB || bit_size != 10 || packing != 1 || encoding != 0 {
            return Err(Error::DecodeFailed(format!(
                "unsupported DPX element: descriptor {} bits {} packing {} encoding {}",
                descriptor, bit_size, packing, encoding
            )));
        }
        let info = ImageInfo::new(width, height, PixelType::RgbU10);
        if !info.is_valid() {
            return Err(Error::DecodeFailed("zero-sized DPX image".into()));
        }

        let line_bytes = width * 4 + eol_padding;
        let need = data_offset + height * line_bytes;
        if data.len() < need {
            return Err(Error::DecodeFailed(format!(
                "DPX pixel data truncated: need {} bytes, have {}",
                need,
                data.len()
            )));
        }

        let mut words = vec![0u32; width * height];
        words.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let line = data_offset + y * line_bytes;
            for (x, slot) in row.iter_mut().enumerate() {
                *slot = ru32(&data, line + x * 4, be);
            }
        });
        Ok(Image::from_buffer(info, PixelBuffer::U32(words)))
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let info = image.info();
        let words = match (image.buffer(), info.pixel_type) {
            (PixelBuffer::U32(v), PixelType::RgbU10) => v,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "DPX stores RgbU10 only, got {}",
                    info.pixel_type
                )));
            }
        };
        let (w, h) = (info.width, info.height);

        let mut header = vec![0u8; WRITE_DATA_OFFSET as usize];
        header[0..4].copy_from_slice(&MAGIC_BE.to_be_bytes());
        header[4..8].copy_from_slice(&WRITE_DATA_OFFSET.to_be_bytes());
        header[8..13].copy_from_slice(b"V2.0\0");
        let file_size = WRITE_DATA_OFFSET + (w * h * 4) as u32;
        header[16..20].copy_from_slice(&file_size.to_be_bytes());
        header[20..24].copy_from_slice(&1u32.to_be_bytes()); // ditto key
        header[24..28].copy_from_slice(&1664u32.to_be_bytes());
        header[28..32].copy_from_slice(&384u32.to_be_bytes());
        header[160..165].copy_from_slice(b"reela");

        // image information: one RGB element, orientation left-right top-down
        header[IMAGE_INFO + 2..IMAGE_INFO + 4].copy_from_slice(&1u16.to_be_bytes());
        header[IMAGE_INFO + 4..IMAGE_INFO + 8].copy_from_slice(&(w as u32).to_be_bytes());
        header[IMAGE_INFO + 8..IMAGE_INFO + 12].copy_from_slice(&(h as u32).to_be_bytes());
        header[ELEMENT_0 + 12..ELEMENT_0 + 16].copy_from_slice(&1023u32.to_be_bytes());
        header[ELEMENT_0 + 20] = DESCRIPTOR_RGB;
        header[ELEMENT_0 + 21] = 2; // linear transfer
        header[ELEMENT_0 + 22] = 2;
        header[ELEMENT_0 + 23] = 10;
        header[ELEMENT_0 + 24..ELEMENT_0 + 26].copy_from_slice(&1u16.to_be_bytes());
        header[ELEMENT_0 + 28..ELEMENT_0 + 32].copy_from_slice(&WRITE_DATA_OFFSET.to_be_bytes());

        let mut pixels = vec![0u8; w * h * 4];
        pixels.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
            for x in 0..w {
                row[4 * x..4 * x + 4].copy_from_slice(&words[y * w + x].to_be_bytes());
            }
        });

        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&header)?;
        out.write_all(&pixels)?;
        out.flush()?;
        Ok(())
    }

    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo> {
        Some(ImageInfo::new(info.width, info.height, PixelType::RgbU10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("reela_dpx_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name).to_string_lossy().into_owned()
    }

    fn word(r: u32, g: u32, b: u32) -> u32 {
        (r << 22) | (g << 12) | (b << 2)
    }

    #[test]
    fn test_round_trip() {
        let path = temp_file("rt.dpx");
        let words: Vec<u32> = (0..6 * 2)
            .map(|i| word(i * 85 % 1024, (i * 171) % 1024, (i * 341) % 1024))
            .collect();
        let image = Image::from_buffer(
            ImageInfo::new(6, 2, PixelType::RgbU10),
            PixelBuffer::U32(words.clone()),
        );

        let codec = DpxCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbU10);
        assert_eq!(decoded.info().width, 6);
        assert_eq!(decoded.info().height, 2);
        match decoded.buffer() {
            PixelBuffer::U32(v) => assert_eq!(v, &words),
            _ => panic!("expected packed words"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_decode_little_endian() {
        let path = temp_file("le.dpx");
        // 1x1 little-endian file assembled by hand
        let mut f = vec![0u8; 8192 + 4];
        f[0..4].copy_from_slice(&MAGIC_LE.to_be_bytes());
        f[4..8].copy_from_slice(&8192u32.to_le_bytes());
        f[IMAGE_INFO + 4..IMAGE_INFO + 8].copy_from_slice(&1u32.to_le_bytes());
        f[IMAGE_INFO + 8..IMAGE_INFO + 12].copy_from_slice(&1u32.to_le_bytes());
        f[ELEMENT_0 + 20] = DESCRIPTOR_RGB;
        f[ELEMENT_0 + 23] = 10;
        f[ELEMENT_0 + 24..ELEMENT_0 + 26].copy_from_slice(&1u16.to_le_bytes());
        f[ELEMENT_0 + 28..ELEMENT_0 + 32].copy_from_slice(&8192u32.to_le_bytes());
        let px = word(1023, 512, 2);
        f[8192..8196].copy_from_slice(&px.to_le_bytes());
        std::fs::write(&path, f).unwrap();

        let decoded = DpxCodec.decode(&path).unwrap();
        match decoded.buffer() {
            PixelBuffer::U32(v) => assert_eq!(v, &vec![px]),
            _ => panic!("expected packed words"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_unsupported_element() {
        let path = temp_file("deep.dpx");
        let mut f = vec![0u8; 8192];
        f[0..4].copy_from_slice(&MAGIC_BE.to_be_bytes());
        f[IMAGE_INFO + 4..IMAGE_INFO + 8].copy_from_slice(&1u32.to_be_bytes());
        f[IMAGE_INFO + 8..IMAGE_INFO + 12].copy_from_slice(&1u32.to_be_bytes());
        f[ELEMENT_0 + 20] = DESCRIPTOR_RGB;
        f[ELEMENT_0 + 23] = 16; // 16-bit element
        std::fs::write(&path, f).unwrap();

        match DpxCodec.decode(&path) {
            Err(Error::DecodeFailed(msg)) => assert!(msg.contains("bits 16")),
            other => panic!("expected decode failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_truncated_pixels_is_error() {
        let path = temp_file("short.dpx");
        let words = vec![word(1, 2, 3); 4];
        let image = Image::from_buffer(
            ImageInfo::new(2, 2, PixelType::RgbU10),
            PixelBuffer::U32(words),
        );
        DpxCodec.encode(&path, &image).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 6);
        std::fs::write(&path, data).unwrap();

        match DpxCodec.decode(&path) {
            Err(Error::DecodeFailed(msg)) => assert!(msg.contains("truncated")),
            other => panic!("expected decode failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_negotiation_always_packs() {
        let codec = DpxCodec;
        for pt in [PixelType::RgbaF32, PixelType::LU8, PixelType::RgbU10] {
            let negotiated = codec.write_info(&ImageInfo::new(4, 4, pt)).unwrap();
            assert_eq!(negotiated.pixel_type, PixelType::RgbU10);
        }
    }
}
