//! SGI image codec
//!
//! Hand-rolled reader/writer for the classic `.sgi`/`.rgb` container:
//! 512-byte big-endian header, channel-planar data with rows stored
//! bottom-to-top. Reads both verbatim and RLE storage; writes verbatim.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use crate::core::workers::Workers;
use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo, PixelBuffer, PixelType};
use crate::io::IoPlugin;
use crate::io::sequence::{Codec, SequencePlugin};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(SequencePlugin::new(
        "sgi",
        &["sgi", "rgb", "rgba", "bw"],
        Arc::new(SgiCodec),
        workers,
    ))
}

const MAGIC: u16 = 474;
const HEADER_LEN: usize = 512;
const STORAGE_VERBATIM: u8 = 0;
const STORAGE_RLE: u8 = 1;

pub struct SgiCodec;

struct Header {
    storage: u8,
    bpc: usize,
    width: usize,
    height: usize,
    channels: usize,
    pixel_type: PixelType,
}

impl Header {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::DecodeFailed(format!(
                "SGI header truncated at {} bytes",
                data.len()
            )));
        }
        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != MAGIC {
            return Err(Error::OpenFailed(format!(
                "not an SGI file (magic {:#06x})",
                magic
            )));
        }
        let storage = data[2];
        if storage > STORAGE_RLE {
            return Err(Error::DecodeFailed(format!(
                "unknown SGI storage mode {}",
                storage
            )));
        }
        let colormap = u32::from_be_bytes([data[104], data[105], data[106], data[107]]);
        if colormap != 0 {
            return Err(Error::DecodeFailed(format!(
                "unsupported SGI colormap mode {}",
                colormap
            )));
        }
        let bpc = data[3] as usize;
        let dimension = u16::from_be_bytes([data[4], data[5]]);
        let width = u16::from_be_bytes([data[6], data[7]]) as usize;
        let height = if dimension >= 2 {
            u16::from_be_bytes([data[8], data[9]]) as usize
        } else {
            1
        };
        let channels = if dimension >= 3 {
            u16::from_be_bytes([data[10], data[11]]) as usize
        } else {
            1
        };
        let pixel_type = match (channels, bpc) {
            (1, 1) => PixelType::LU8,
            (2, 1) => PixelType::LaU8,
            (3, 1) => PixelType::RgbU8,
            (4, 1) => PixelType::RgbaU8,
            (1, 2) => PixelType::LU16,
            (2, 2) => PixelType::LaU16,
            (3, 2) => PixelType::RgbU16,
            (4, 2) => PixelType::RgbaU16,
            (z, b) => {
                return Err(Error::DecodeFailed(format!(
                    "unsupported SGI shape: {} planes at {} bytes per channel",
                    z, b
                )));
            }
        };
        if width == 0 || height == 0 {
            return Err(Error::DecodeFailed("zero-sized SGI image".into()));
        }
        Ok(Self { storage, bpc, width, height, channels, pixel_type })
    }

    /// Offset table entry for one RLE scanline (tables follow the header:
    /// starts first, then lengths, each `height * channels` u32 entries)
    fn rle_entry(&self, data: &[u8], z: usize, fy: usize) -> Result<(usize, usize)> {
        let table = self.height * self.channels * 4;
        let starts = data
            .get(HEADER_LEN..HEADER_LEN + table)
            .ok_or_else(short_file)?;
        let lengths = data
            .get(HEADER_LEN + table..HEADER_LEN + 2 * table)
            .ok_or_else(short_file)?;
        let i = 4 * (z * self.height + fy);
        let start = u32::from_be_bytes([starts[i], starts[i + 1], starts[i + 2], starts[i + 3]]);
        let len = u32::from_be_bytes([lengths[i], lengths[i + 1], lengths[i + 2], lengths[i + 3]]);
        Ok((start as usize, len as usize))
    }

    fn row_u8(&self, data: &[u8], z: usize, fy: usize, row: &mut [u8]) -> Result<()> {
        match self.storage {
            STORAGE_VERBATIM => {
                let off = HEADER_LEN + (z * self.height + fy) * self.width;
                let src = data.get(off..off + self.width).ok_or_else(short_file)?;
                row.copy_from_slice(src);
                Ok(())
            }
            _ => {
                let (start, len) = self.rle_entry(data, z, fy)?;
                let src = data.get(start..start + len).ok_or_else(short_file)?;
                rle_row_u8(src, row)
            }
        }
    }

    fn row_u16(&self, data: &[u8], z: usize, fy: usize, row: &mut [u16]) -> Result<()> {
        match self.storage {
            STORAGE_VERBATIM => {
                let off = HEADER_LEN + (z * self.height + fy) * self.width * 2;
                let src = data.get(off..off + self.width * 2).ok_or_else(short_file)?;
                for (x, out) in row.iter_mut().enumerate() {
                    *out = u16::from_be_bytes([src[2 * x], src[2 * x + 1]]);
                }
                Ok(())
            }
            _ => {
                let (start, len) = self.rle_entry(data, z, fy)?;
                let src = data.get(start..start + len).ok_or_else(short_file)?;
                rle_row_u16(src, row)
            }
        }
    }
}

fn short_file() -> Error {
    Error::DecodeFailed("SGI pixel data truncated".into())
}

fn rle_overrun() -> Error {
    Error::DecodeFailed("SGI RLE run overruns scanline".into())
}

/// One RLE scanline, 8-bit samples: low 7 bits of the control byte are the
/// run length (0 terminates), high bit selects literal copy vs replicate
fn rle_row_u8(src: &[u8], out: &mut [u8]) -> Result<()> {
    let mut s = 0usize;
    let mut x = 0usize;
    loop {
        let v = *src.get(s).ok_or_else(short_file)?;
        s += 1;
        let count = (v & 0x7f) as usize;
        if count == 0 {
            return Ok(());
        }
        if x + count > out.len() {
            return Err(rle_overrun());
        }
        if v & 0x80 != 0 {
            let lit = src.get(s..s + count).ok_or_else(short_file)?;
            out[x..x + count].copy_from_slice(lit);
            s += count;
        } else {
            let p = *src.get(s).ok_or_else(short_file)?;
            s += 1;
            out[x..x + count].fill(p);
        }
        x += count;
    }
}

/// Same scheme with 16-bit big-endian samples, control word included
fn rle_row_u16(src: &[u8], out: &mut [u16]) -> Result<()> {
    let mut s = 0usize;
    let mut x = 0usize;
    loop {
        let c = src.get(s..s + 2).ok_or_else(short_file)?;
        s += 2;
        let v = u16::from_be_bytes([c[0], c[1]]);
        let count = (v & 0x7f) as usize;
        if count == 0 {
            return Ok(());
        }
        if x + count > out.len() {
            return Err(rle_overrun());
        }
        if v & 0x80 != 0 {
            for i in 0..count {
                let b = src.get(s + 2 * i..s + 2 * i + 2).ok_or_else(short_file)?;
                out[x + i] = u16::from_be_bytes([b[0], b[1]]);
            }
            s += 2 * count;
        } else {
            let b = src.get(s..s + 2).ok_or_else(short_file)?;
            let p = u16::from_be_bytes([b[0], b[1]]);
            s += 2;
            out[x..x + count].fill(p);
        }
        x += count;
    }
}

fn decode_planes_u8(data: &[u8], hdr: &Header) -> Result<Vec<u8>> {
    let (w, h, ch) = (hdr.width, hdr.height, hdr.channels);
    let mut out = vec![0u8; w * h * ch];
    let mut row = vec![0u8; w];
    for z in 0..ch {
        for fy in 0..h {
            hdr.row_u8(data, z, fy, &mut row)?;
            let base = (h - 1 - fy) * w * ch + z;
            for (x, &v) in row.iter().enumerate() {
                out[base + x * ch] = v;
            }
        }
    }
    Ok(out)
}

fn decode_planes_u16(data: &[u8], hdr: &Header) -> Result<Vec<u16>> {
    let (w, h, ch) = (hdr.width, hdr.height, hdr.channels);
    let mut out = vec![0u16; w * h * ch];
    let mut row = vec![0u16; w];
    for z in 0..ch {
        for fy in 0..h {
            hdr.row_u16(data, z, fy, &mut row)?;
            let base = (h - 1 - fy) * w * ch + z;
            for (x, &v) in row.iter().enumerate() {
                out[base + x * ch] = v;
            }
        }
    }
    Ok(out)
}

fn open_with_header(
    path: &str,
    w: usize,
    h: usize,
    ch: usize,
    bpc: u8,
) -> Result<BufWriter<File>> {
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    header[2] = STORAGE_VERBATIM;
    header[3] = bpc;
    let dimension: u16 = if ch == 1 { 2 } else { 3 };
    header[4..6].copy_from_slice(&dimension.to_be_bytes());
    header[6..8].copy_from_slice(&(w as u16).to_be_bytes());
    header[8..10].copy_from_slice(&(h as u16).to_be_bytes());
    header[10..12].copy_from_slice(&(ch as u16).to_be_bytes());
    let pixmax: u32 = if bpc == 1 { 255 } else { 65535 };
    header[16..20].copy_from_slice(&pixmax.to_be_bytes());
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header)?;
    Ok(out)
}

impl Codec for SgiCodec {
    fn decode(&self, path: &str) -> Result<Image> {
        let data = std::fs::read(path)?;
        let hdr = Header::parse(&data)?;
        let info = ImageInfo::new(hdr.width, hdr.height, hdr.pixel_type);
        let buffer = match hdr.bpc {
            1 => PixelBuffer::U8(decode_planes_u8(&data, &hdr)?),
            _ => PixelBuffer::U16(decode_planes_u16(&data, &hdr)?),
        };
        Ok(Image::from_buffer(info, buffer))
    }

    fn encode(&self, path: &str, image: &Image) -> Result<()> {
        let info = image.info();
        let (w, h) = (info.width, info.height);
        let ch = info.pixel_type.channel_count();
        match image.buffer() {
            PixelBuffer::U8(v) => {
                let mut out = open_with_header(path, w, h, ch, 1)?;
                let mut row = vec![0u8; w];
                for z in 0..ch {
                    for fy in 0..h {
                        let base = (h - 1 - fy) * w * ch + z;
                        for (x, slot) in row.iter_mut().enumerate() {
                            *slot = v[base + x * ch];
                        }
                        out.write_all(&row)?;
                    }
                }
                out.flush()?;
                Ok(())
            }
            PixelBuffer::U16(v) => {
                let mut out = open_with_header(path, w, h, ch, 2)?;
                let mut row = vec![0u8; w * 2];
                for z in 0..ch {
                    for fy in 0..h {
                        let base = (h - 1 - fy) * w * ch + z;
                        for x in 0..w {
                            row[2 * x..2 * x + 2]
                                .copy_from_slice(&v[base + x * ch].to_be_bytes());
                        }
                        out.write_all(&row)?;
                    }
                }
                out.flush()?;
                Ok(())
            }
            _ => Err(Error::InvalidArgument(format!(
                "SGI cannot store {}",
                info.pixel_type
            ))),
        }
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

    fn temp_file(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("reela_sgi_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_round_trip_rgb8() {
        let path = temp_file("rt.sgi");
        let raw: Vec<u8> = (0..5 * 4 * 3).map(|i| (i * 11 % 256) as u8).collect();
        let image = Image::from_buffer(
            ImageInfo::new(5, 4, PixelType::RgbU8),
            PixelBuffer::U8(raw.clone()),
        );

        let codec = SgiCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::RgbU8);
        assert_eq!(decoded.buffer().bytes(), raw.as_slice());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_round_trip_la16() {
        let path = temp_file("rt16.sgi");
        let raw: Vec<u16> = (0..3 * 2 * 2).map(|i| (i * 4099 % 65536) as u16).collect();
        let image = Image::from_buffer(
            ImageInfo::new(3, 2, PixelType::LaU16),
            PixelBuffer::U16(raw.clone()),
        );

        let codec = SgiCodec;
        codec.encode(&path, &image).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.info().pixel_type, PixelType::LaU16);
        match decoded.buffer() {
            PixelBuffer::U16(v) => assert_eq!(v, &raw),
            _ => panic!("expected 16-bit storage"),
        }
        std::fs::remove_file(&path).ok();
    }

    /// 3x2 single-channel RLE file built by hand: bottom row is a
    /// replicate run of 7, top row a literal run 1,2,3
    fn rle_fixture() -> Vec<u8> {
        let mut f = vec![0u8; 536];
        f[0..2].copy_from_slice(&474u16.to_be_bytes());
        f[2] = 1; // RLE
        f[3] = 1;
        f[4..6].copy_from_slice(&2u16.to_be_bytes());
        f[6..8].copy_from_slice(&3u16.to_be_bytes());
        f[8..10].copy_from_slice(&2u16.to_be_bytes());
        // start/length tables, two rows
        f[512..516].copy_from_slice(&528u32.to_be_bytes());
        f[516..520].copy_from_slice(&531u32.to_be_bytes());
        f[520..524].copy_from_slice(&3u32.to_be_bytes());
        f[524..528].copy_from_slice(&5u32.to_be_bytes());
        f[528..531].copy_from_slice(&[0x03, 7, 0x00]);
        f[531..536].copy_from_slice(&[0x83, 1, 2, 3, 0x00]);
        f
    }

    #[test]
    fn test_decode_rle() {
        let path = temp_file("rle.sgi");
        std::fs::write(&path, rle_fixture()).unwrap();

        let decoded = SgiCodec.decode(&path).unwrap();
        assert_eq!(decoded.info().pixel_type, PixelType::LU8);
        assert_eq!(decoded.info().width, 3);
        assert_eq!(decoded.info().height, 2);
        // rows flip to top-down in memory
        assert_eq!(decoded.buffer().bytes(), &[1, 2, 3, 7, 7, 7]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_decode_rle_overrun_is_error() {
        let path = temp_file("bad.sgi");
        let mut f = rle_fixture();
        f[528] = 0x0a; // run of 10 into a width-3 scanline
        std::fs::write(&path, f).unwrap();

        match SgiCodec.decode(&path) {
            Err(Error::DecodeFailed(_)) => {}
            other => panic!("expected decode failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_foreign_magic() {
        let path = temp_file("not.sgi");
        std::fs::write(&path, vec![0u8; 600]).unwrap();

        match SgiCodec.decode(&path) {
            Err(Error::OpenFailed(_)) => {}
            other => panic!("expected open failure, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_negotiation() {
        let codec = SgiCodec;
        let float = ImageInfo::new(8, 8, PixelType::RgbF32);
        assert_eq!(codec.write_info(&float).unwrap().pixel_type, PixelType::RgbU16);
        let packed = ImageInfo::new(8, 8, PixelType::RgbU10);
        assert_eq!(codec.write_info(&packed).unwrap().pixel_type, PixelType::RgbU16);
        let passthrough = ImageInfo::new(8, 8, PixelType::RgbaU8);
        assert_eq!(codec.write_info(&passthrough).unwrap().pixel_type, PixelType::RgbaU8);
    }
}
