//! Kodak Cineon image codec
//!
//! The film-scan ancestor of DPX: same 10-bit RGB filled into 32-bit
//! words, older header. Reads pixel-interleaved 3-channel 10-bit files
//! in either byte order; writes the classic big-endian form with data
//! at offset 2048.

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
    Arc::new(SequencePlugin::new("cineon", &["cin"], Arc::new(CineonCodec), workers))
}

const MAGIC: u32 = 0x802A_5FD7;
const MAGIC_SWAPPED: u32 = 0xD75F_2A80;
const IMAGE_INFO: usize = 192;
const CHANNEL_0: usize = IMAGE_INFO + 4;
const CHANNEL_LEN: usize = 28;
const FORMAT_INFO: usize = 680;
const WRITE_DATA_OFFSET: u32 = 2048;
const PACKING_FILLED_WORDS: u8 = 5;

pub struct CineonCodec;

fn ru32(data: &[u8], off: usize, be: bool) -> u32 {
    let b = [data[off], data[off + 1], data[off + 2], data[off + 3]];
    if be { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) }
}

impl Codec for CineonCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        let data = std::fs::read(path)?;
        if data.len() < FORMAT_INFO + 12 {
            return Err(Error::DecodeFailed(format!(
                "Cineon header truncated at {} bytes",
                data.len()
            )));
        }
        let be = match u32::from_be_bytes([data[0], data[1], data[2], data[3]]) {
            MAGIC => true,
            MAGIC_SWAPPED => false,
            other => {
                return Err(Error::OpenFailed(format!(
                    "not a Cineon file (magic {:#010x})",
                    other
                )));
            }
        };

        let data_offset = ru32(&data, 4, be) as usize;
        let channels = data[IMAGE_INFO + 1] as usize;
        if channels != 3 {
            return Err(Error::DecodeFailed(format!(
                "unsupported Cineon channel count {}",
                channels
            )));
        }
        for c in 0..channels {
            let depth = data[CHANNEL_0 + c * CHANNEL_LEN + 2];
            if depth != 10 {
                return Err(Error::DecodeFailed(format!(
                    "unsupported Cineon channel depth {} bits",
                    depth
                )));
            }
        }
        let width = ru32(&data, CHANNEL_0 + 4, be) as usize;
        let height = ru32(&data, CHANNEL_0 + 8, be) as usize;
        let interleave = data[FORMAT_INFO];
        let packing = data[FORMAT_INFO + 1];
        if interleave != 0 || packing != PACKING_FILLED_WORDS {
            return Err(Error::DecodeFailed(format!(
                "unsupported Cineon layout: interleave {} packing {}",
                interleave, packing
            )));
        }
        let eol_padding = ru32(&data, FORMAT_INFO + 4, be) as usize;

        let info = ImageInfo::new(width, height, PixelType::RgbU10);
        if !info.is_valid() {
            return Err(Error::DecodeFailed("zero-sized Cineon image".into()));
        }
        let line_bytes = width * 4 + eol_padding;
        let need = data_offset + height * line_bytes;
        if data.len() < need {
            return Err(Error::DecodeFailed(format!(
                "Cineon pixel data truncated: need {} bytes, have {}",
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
                    "Cineon stores RgbU10 only, got {}",
                    info.pixel_type
                )));
            }
        };
        let (w, h) = (info.width, info.height);

        let mut header = vec![0u8; WRITE_DATA_OFFSET as usize];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&WRITE_DATA_OFFSET.to_be_bytes());
        header[8..12].copy_from_slice(&1024u32.to_be_bytes());
        header[12..16].copy_from_slice(&1024u32.to_be_bytes());
        let file_size = WRITE_DATA_OFFSET + (w * h * 4) as u32;
        header[20..24].copy_from_slice(&file_size.to_be_bytes());
        header[24..28].copy_from_slice(b"V4.5");

        header[IMAGE_INFO + 1] = 3;
        for c in 0..3usize {
            let at = CHANNEL_0 + c * CHANNEL_LEN;
            header[at + 1] = c as u8 + 1; // R, G, B designators
            header[at + 2] = 10;
            header[at + 4..at + 8].copy_from_slice(&(w as u32).to_be_bytes());
            header[at + 8..at + 12].copy_from_slice(&(h as u32).to_be_bytes());
            // printing density range 0.0 - 2.046 over code values 0 - 1023
            header[at + 16..at + 20].copy_from_slice(&0.0f32.to_be_bytes());
            header[at + 20..at + 24].copy_from_slice(&1023.0f32.to_be_bytes());
            header[at + 24..at + 28].copy_from_slice(&2.046f32.to_be_bytes());
        }
        header[FORMAT_INFO + 1] = PACKING_FILLED_WORDS;

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
        let dir = std::env::temp_dir().join(format!("reela_cin_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name).to_string_lossy().into_owned()
    }

    fn word(r: u32, g: u32, b: u32) -> u32 {
        (r << 22) | (g << 12) | (b << 2)
    }

    #[test]
    fn test_round_trip() {
        let path = temp_file("rt.cin");
        let words: Vec<u32> = (0..4 * 3).map(|i| word(i * 93 % 1024, i, 1023 - i)).collect();
        let image = Image::from_buffer(
            ImageInfo::new(4, 3, PixelType::RgbU10),
            PixelBuffer::U32(words.clone()),
        );

        let codec = CineonCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbU10);
        assert_eq!(decoded.info().width, 4);
        assert_eq!(decoded.info().height, 3);
        match decoded.buffer() {
            PixelBuffer::U32(v) => assert_eq!(v, &words),
            _ => panic!("expected packed words"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_non_rgb() {
        let path = temp_file("mono.cin");
        let mut f = vec![0u8; 2048];
        f[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        f[4..8].copy_from_slice(&2048u32.to_be_bytes());
        f[IMAGE_INFO + 1] = 1; // single channel
        std::fs::write(&path, f).unwrap();

        match CineonCodec.decode(&path) {
            Err(Error::DecodeFailed(msg)) => assert!(msg.contains("channel count 1")),
            other => panic!("expected decode failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_foreign_magic() {
        let path = temp_file("not.cin");
        std::fs::write(&path, vec![0xffu8; 800]).unwrap();

        match CineonCodec.decode(&path) {
            Err(Error::OpenFailed(_)) => {}
            other => panic!("expected open failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_negotiation_always_packs() {
        let negotiated = CineonCodec.write_info(&ImageInfo::new(2, 2, PixelType::LaF16)).unwrap();
        assert_eq!(negotiated.pixel_type, PixelType::RgbU10);
    }
}
