//! Image buffers, pixel types, metadata
//!
//! **Why**: Decoders produce and writers consume one owning frame type.
//! Keeping the pixel grid (layer × depth) explicit lets codecs negotiate
//! what they can store instead of silently converting.
//!
//! **Used by**: I/O plugins (decode targets, write sources), frame cache
//! (byte accounting), player (published frames)
//!
//! # Storage
//!
//! In-memory buffers are tightly packed, native-endian, top-down. The
//! `ImageLayout` carried by `ImageInfo` describes the *file* side: writers
//! honor its endianness and row alignment at encode time, readers normalize
//! on decode. `RgbU10` packs one pixel per 32-bit word (R 31..22, G 21..12,
//! B 11..2), the layout Cineon and DPX share.

use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pixel format grid: channel layer × channel depth, plus packed 10-bit RGB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    LU8,
    LU16,
    LU32,
    LF16,
    LF32,
    LaU8,
    LaU16,
    LaU32,
    LaF16,
    LaF32,
    RgbU8,
    RgbU16,
    RgbU32,
    RgbF16,
    RgbF32,
    RgbU10,
    RgbaU8,
    RgbaU16,
    RgbaU32,
    RgbaF16,
    RgbaF32,
}

impl PixelType {
    pub fn channel_count(&self) -> usize {
        use PixelType::*;
        match self {
            LU8 | LU16 | LU32 | LF16 | LF32 => 1,
            LaU8 | LaU16 | LaU32 | LaF16 | LaF32 => 2,
            RgbU8 | RgbU16 | RgbU32 | RgbF16 | RgbF32 | RgbU10 => 3,
            RgbaU8 | RgbaU16 | RgbaU32 | RgbaF16 | RgbaF32 => 4,
        }
    }

    /// Bits per channel
    pub fn bit_depth(&self) -> usize {
        use PixelType::*;
        match self {
            LU8 | LaU8 | RgbU8 | RgbaU8 => 8,
            LU16 | LaU16 | RgbU16 | RgbaU16 | LF16 | LaF16 | RgbF16 | RgbaF16 => 16,
            LU32 | LaU32 | RgbU32 | RgbaU32 | LF32 | LaF32 | RgbF32 | RgbaF32 => 32,
            RgbU10 => 10,
        }
    }

    pub fn is_float(&self) -> bool {
        use PixelType::*;
        matches!(
            self,
            LF16 | LF32 | LaF16 | LaF32 | RgbF16 | RgbF32 | RgbaF16 | RgbaF32
        )
    }

    /// Whole-pixel byte count in tightly packed storage
    pub fn pixel_byte_count(&self) -> usize {
        match self {
            PixelType::RgbU10 => 4,
            _ => self.channel_count() * (self.bit_depth() / 8),
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self.channel_count(), 2 | 4)
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// File-side byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") { Endian::Big } else { Endian::Little }
    }
}

/// File-side row layout: scanline byte alignment plus byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    /// Rows start on a multiple of this many bytes (1 = tight)
    pub alignment: usize,
    pub endian: Endian,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self { alignment: 1, endian: Endian::native() }
    }
}

/// Shape of an image: dimensions, pixel format, file layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub pixel_type: PixelType,
    pub layout: ImageLayout,
}

impl ImageInfo {
    pub fn new(width: usize, height: usize, pixel_type: PixelType) -> Self {
        Self { width, height, pixel_type, layout: ImageLayout::default() }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Bytes per row honoring the layout alignment
    pub fn row_byte_count(&self) -> usize {
        let tight = self.width * self.pixel_type.pixel_byte_count();
        let a = self.layout.alignment.max(1);
        tight.div_ceil(a) * a
    }

    pub fn data_byte_count(&self) -> usize {
        self.row_byte_count() * self.height
    }
}

impl std::fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_type)
    }
}

/// Typed pixel storage, tightly packed
///
/// `RgbU10` lives in `U32` (one packed word per pixel).
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F16(Vec<f16>),
    F32(Vec<f32>),
}

impl PixelBuffer {
    /// Native-endian byte view for renderer upload
    pub fn bytes(&self) -> &[u8] {
        match self {
            PixelBuffer::U8(v) => v,
            PixelBuffer::U16(v) => bytemuck::cast_slice(v),
            PixelBuffer::U32(v) => bytemuck::cast_slice(v),
            PixelBuffer::F16(v) => bytemuck::cast_slice(v),
            PixelBuffer::F32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn byte_count(&self) -> usize {
        self.bytes().len()
    }

    /// Elements per pixel for this storage under the given pixel type
    fn elems_per_pixel(pixel_type: PixelType) -> usize {
        match pixel_type {
            PixelType::RgbU10 => 1,
            t => t.channel_count(),
        }
    }
}

/// Typed HDR mastering metadata attached to decoded frames
///
/// Replaces string-tag side channels: unknown metadata still rides the tag
/// map, HDR display data gets a real struct. Defaults are HDR10-style
/// BT.2020 primaries with a 0.0001-1000 nit mastering range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdrData {
    pub red: [f32; 2],
    pub green: [f32; 2],
    pub blue: [f32; 2],
    pub white: [f32; 2],
    /// Mastering display min/max luminance in nits
    pub mastering_luminance: [f32; 2],
    pub max_cll: f32,
    pub max_fall: f32,
}

impl Default for HdrData {
    fn default() -> Self {
        Self {
            red: [0.708, 0.292],
            green: [0.170, 0.797],
            blue: [0.131, 0.046],
            white: [0.3127, 0.3290],
            mastering_luminance: [0.0001, 1000.0],
            max_cll: 0.0,
            max_fall: 0.0,
        }
    }
}

/// Owning frame: typed pixels + string tags + optional HDR side data
#[derive(Debug, Clone)]
pub struct Image {
    info: ImageInfo,
    buffer: PixelBuffer,
    tags: HashMap<String, String>,
    hdr: Option<HdrData>,
}

impl Image {
    /// Zeroed image of the given shape
    pub fn new(info: ImageInfo) -> Self {
        let n = info.width * info.height * PixelBuffer::elems_per_pixel(info.pixel_type);
        let buffer = match info.pixel_type {
            PixelType::LU8 | PixelType::LaU8 | PixelType::RgbU8 | PixelType::RgbaU8 => {
                PixelBuffer::U8(vec![0; n])
            }
            PixelType::LU16 | PixelType::LaU16 | PixelType::RgbU16 | PixelType::RgbaU16 => {
                PixelBuffer::U16(vec![0; n])
            }
            PixelType::LU32
            | PixelType::LaU32
            | PixelType::RgbU32
            | PixelType::RgbaU32
            | PixelType::RgbU10 => PixelBuffer::U32(vec![0; n]),
            PixelType::LF16 | PixelType::LaF16 | PixelType::RgbF16 | PixelType::RgbaF16 => {
                PixelBuffer::F16(vec![f16::ZERO; n])
            }
            PixelType::LF32 | PixelType::LaF32 | PixelType::RgbF32 | PixelType::RgbaF32 => {
                PixelBuffer::F32(vec![0.0; n])
            }
        };
        Self { info, buffer, tags: HashMap::new(), hdr: None }
    }

    /// Adopt an existing buffer; length must match the shape
    pub fn from_buffer(info: ImageInfo, buffer: PixelBuffer) -> Self {
        debug_assert_eq!(
            buffer.byte_count(),
            info.width * info.height * info.pixel_type.pixel_byte_count()
        );
        Self { info, buffer, tags: HashMap::new(), hdr: None }
    }

    /// Opaque black frame of the given shape (alpha forced to 1)
    ///
    /// Substitute for failed decodes; callers tag it with `ioError`.
    pub fn black(info: ImageInfo) -> Self {
        let mut img = Self::new(info);
        if info.pixel_type.has_alpha() {
            let w = info.width;
            let black = [0.0f32, 0.0, 0.0, 1.0];
            let mut row = vec![0.0f32; w * 4];
            for px in row.chunks_exact_mut(4) {
                px.copy_from_slice(&black);
            }
            for y in 0..info.height {
                img.pack_row(y, &row);
            }
        }
        img
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    pub fn byte_count(&self) -> usize {
        self.buffer.byte_count()
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn set_tags(&mut self, tags: HashMap<String, String>) {
        self.tags = tags;
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    pub fn hdr(&self) -> Option<&HdrData> {
        self.hdr.as_ref()
    }

    pub fn set_hdr(&mut self, hdr: Option<HdrData>) {
        self.hdr = hdr;
    }

    /// Read one row as normalized RGBA f32 (`out` length = width * 4)
    ///
    /// Single-channel types replicate into RGB; missing alpha reads as 1.
    pub fn unpack_row(&self, y: usize, out: &mut [f32]) {
        let w = self.info.width;
        let pt = self.info.pixel_type;
        let ch = pt.channel_count();
        let epp = PixelBuffer::elems_per_pixel(pt);
        let row_off = y * w * epp;

        let mut chans = [0.0f32; 4];
        for x in 0..w {
            let base = row_off + x * epp;
            match (&self.buffer, pt) {
                (PixelBuffer::U32(v), PixelType::RgbU10) => {
                    let word = v[base];
                    chans[0] = ((word >> 22) & 0x3ff) as f32 / 1023.0;
                    chans[1] = ((word >> 12) & 0x3ff) as f32 / 1023.0;
                    chans[2] = ((word >> 2) & 0x3ff) as f32 / 1023.0;
                }
                (PixelBuffer::U8(v), _) => {
                    for c in 0..ch {
                        chans[c] = v[base + c] as f32 / u8::MAX as f32;
                    }
                }
                (PixelBuffer::U16(v), _) => {
                    for c in 0..ch {
                        chans[c] = v[base + c] as f32 / u16::MAX as f32;
                    }
                }
                (PixelBuffer::U32(v), _) => {
                    for c in 0..ch {
                        chans[c] = (v[base + c] as f64 / u32::MAX as f64) as f32;
                    }
                }
                (PixelBuffer::F16(v), _) => {
                    for c in 0..ch {
                        chans[c] = v[base + c].to_f32();
                    }
                }
                (PixelBuffer::F32(v), _) => {
                    chans[..ch].copy_from_slice(&v[base..base + ch]);
                }
            }

            let o = x * 4;
            match ch {
                1 => {
                    out[o] = chans[0];
                    out[o + 1] = chans[0];
                    out[o + 2] = chans[0];
                    out[o + 3] = 1.0;
                }
                2 => {
                    out[o] = chans[0];
                    out[o + 1] = chans[0];
                    out[o + 2] = chans[0];
                    out[o + 3] = chans[1];
                }
                3 => {
                    out[o] = chans[0];
                    out[o + 1] = chans[1];
                    out[o + 2] = chans[2];
                    out[o + 3] = 1.0;
                }
                _ => out[o..o + 4].copy_from_slice(&chans),
            }
        }
    }

    /// Write one row from normalized RGBA f32
    pub fn pack_row(&mut self, y: usize, rgba: &[f32]) {
        let w = self.info.width;
        let pt = self.info.pixel_type;
        let epp = PixelBuffer::elems_per_pixel(pt);
        let row_off = y * w * epp;
        for x in 0..w {
            let base = row_off + x * epp;
            pack_pixel(&mut self.buffer, pt, base, &rgba[x * 4..x * 4 + 4]);
        }
    }

    /// Convert to another pixel type; tags and HDR data carry over
    ///
    /// Goes through normalized RGBA f32 rows in parallel. Luma from RGB uses
    /// Rec. 709 weights.
    pub fn converted(&self, pixel_type: PixelType) -> Image {
        if pixel_type == self.info.pixel_type {
            return self.clone();
        }
        let w = self.info.width;
        let mut info = self.info;
        info.pixel_type = pixel_type;
        info.layout = ImageLayout::default();

        let mut dst = Image::new(info);
        let epp = PixelBuffer::elems_per_pixel(pixel_type);
        let row_elems = w * epp;

        macro_rules! convert_rows {
            ($vec:expr) => {
                $vec.par_chunks_mut(row_elems).enumerate().for_each(|(y, row)| {
                    let mut rgba = vec![0.0f32; w * 4];
                    self.unpack_row(y, &mut rgba);
                    for x in 0..w {
                        pack_pixel_slice(row, pixel_type, x * epp, &rgba[x * 4..x * 4 + 4]);
                    }
                })
            };
        }
        match &mut dst.buffer {
            PixelBuffer::U8(v) => convert_rows!(v),
            PixelBuffer::U16(v) => convert_rows!(v),
            PixelBuffer::U32(v) => convert_rows!(v),
            PixelBuffer::F16(v) => convert_rows!(v),
            PixelBuffer::F32(v) => convert_rows!(v),
        }

        dst.tags = self.tags.clone();
        dst.hdr = self.hdr.clone();
        dst
    }
}

/// Rec. 709 luma for RGB→L downmixes
fn luma(rgba: &[f32]) -> f32 {
    0.2126 * rgba[0] + 0.7152 * rgba[1] + 0.0722 * rgba[2]
}

fn channel_values(pt: PixelType, rgba: &[f32]) -> ([f32; 4], usize) {
    let ch = pt.channel_count();
    let mut out = [0.0f32; 4];
    match ch {
        1 => out[0] = luma(rgba),
        2 => {
            out[0] = luma(rgba);
            out[1] = rgba[3];
        }
        _ => out[..ch].copy_from_slice(&rgba[..ch]),
    }
    (out, ch)
}

fn pack_pixel(buffer: &mut PixelBuffer, pt: PixelType, base: usize, rgba: &[f32]) {
    match buffer {
        PixelBuffer::U8(v) => pack_pixel_slice(v, pt, base, rgba),
        PixelBuffer::U16(v) => pack_pixel_slice(v, pt, base, rgba),
        PixelBuffer::U32(v) => pack_pixel_slice(v, pt, base, rgba),
        PixelBuffer::F16(v) => pack_pixel_slice(v, pt, base, rgba),
        PixelBuffer::F32(v) => pack_pixel_slice(v, pt, base, rgba),
    }
}

/// Storage-generic pixel store, normalized [0,1] in, clamped for integers
trait PackChannel: Copy {
    fn from_norm(v: f32) -> Self;
    fn pack_u10(slot: &mut Self, rgba: &[f32]);
}

impl PackChannel for u8 {
    fn from_norm(v: f32) -> Self {
        (v.clamp(0.0, 1.0) * u8::MAX as f32).round() as u8
    }
    fn pack_u10(_slot: &mut Self, _rgba: &[f32]) {
        unreachable!("RgbU10 stores in U32")
    }
}

impl PackChannel for u16 {
    fn from_norm(v: f32) -> Self {
        (v.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
    }
    fn pack_u10(_slot: &mut Self, _rgba: &[f32]) {
        unreachable!("RgbU10 stores in U32")
    }
}

impl PackChannel for u32 {
    fn from_norm(v: f32) -> Self {
        (v.clamp(0.0, 1.0) as f64 * u32::MAX as f64).round() as u32
    }
    fn pack_u10(slot: &mut Self, rgba: &[f32]) {
        let r = (rgba[0].clamp(0.0, 1.0) * 1023.0).round() as u32;
        let g = (rgba[1].clamp(0.0, 1.0) * 1023.0).round() as u32;
        let b = (rgba[2].clamp(0.0, 1.0) * 1023.0).round() as u32;
        *slot = (r << 22) | (g << 12) | (b << 2);
    }
}

impl PackChannel for f16 {
    fn from_norm(v: f32) -> Self {
        f16::from_f32(v)
    }
    fn pack_u10(_slot: &mut Self, _rgba: &[f32]) {
        unreachable!("RgbU10 stores in U32")
    }
}

impl PackChannel for f32 {
    fn from_norm(v: f32) -> Self {
        v
    }
    fn pack_u10(_slot: &mut Self, _rgba: &[f32]) {
        unreachable!("RgbU10 stores in U32")
    }
}

fn pack_pixel_slice<T: PackChannel>(out: &mut [T], pt: PixelType, base: usize, rgba: &[f32]) {
    if pt == PixelType::RgbU10 {
        let slot = &mut out[base];
        T::pack_u10(slot, rgba);
        return;
    }
    let (vals, ch) = channel_values(pt, rgba);
    for c in 0..ch {
        out[base + c] = T::from_norm(vals[c]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_sizes() {
        assert_eq!(PixelType::RgbaU8.pixel_byte_count(), 4);
        assert_eq!(PixelType::RgbF16.pixel_byte_count(), 6);
        assert_eq!(PixelType::LU32.pixel_byte_count(), 4);
        assert_eq!(PixelType::RgbU10.pixel_byte_count(), 4);
        assert_eq!(PixelType::RgbU10.channel_count(), 3);
        assert_eq!(PixelType::RgbU10.bit_depth(), 10);
    }

    #[test]
    fn test_row_alignment() {
        let mut info = ImageInfo::new(3, 2, PixelType::LU8);
        assert_eq!(info.row_byte_count(), 3);
        info.layout.alignment = 4;
        assert_eq!(info.row_byte_count(), 4);
        assert_eq!(info.data_byte_count(), 8);
    }

    #[test]
    fn test_new_is_sized() {
        let img = Image::new(ImageInfo::new(8, 4, PixelType::RgbaF16));
        assert_eq!(img.byte_count(), 8 * 4 * 8);
        let img10 = Image::new(ImageInfo::new(8, 4, PixelType::RgbU10));
        assert_eq!(img10.byte_count(), 8 * 4 * 4);
    }

    #[test]
    fn test_black_has_opaque_alpha() {
        let img = Image::black(ImageInfo::new(2, 2, PixelType::RgbaU8));
        match img.buffer() {
            PixelBuffer::U8(v) => {
                assert_eq!(&v[..4], &[0, 0, 0, 255]);
            }
            _ => panic!("wrong storage"),
        }
        // no alpha channel -> plain zeros
        let l = Image::black(ImageInfo::new(2, 2, PixelType::LU16));
        match l.buffer() {
            PixelBuffer::U16(v) => assert!(v.iter().all(|&s| s == 0)),
            _ => panic!("wrong storage"),
        }
    }

    #[test]
    fn test_u10_roundtrip() {
        let mut img = Image::new(ImageInfo::new(1, 1, PixelType::RgbU10));
        img.pack_row(0, &[1.0, 0.5, 0.0, 1.0]);
        let mut out = [0.0f32; 4];
        img.unpack_row(0, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert!((out[1] - 0.5).abs() < 1e-3);
        assert!(out[2].abs() < 1e-3);
        assert_eq!(out[3], 1.0);
    }

    #[test]
    fn test_convert_u8_to_f32() {
        let mut img = Image::new(ImageInfo::new(2, 1, PixelType::RgbaU8));
        img.pack_row(0, &[1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.5]);
        let f = img.converted(PixelType::RgbaF32);
        match f.buffer() {
            PixelBuffer::F32(v) => {
                assert_eq!(v[0], 1.0);
                assert_eq!(v[5], 1.0);
                assert!((v[7] - 0.5).abs() < 0.01);
            }
            _ => panic!("wrong storage"),
        }
    }

    #[test]
    fn test_convert_rgb_to_luma() {
        let mut img = Image::new(ImageInfo::new(1, 1, PixelType::RgbF32));
        img.pack_row(0, &[1.0, 1.0, 1.0, 1.0]);
        let l = img.converted(PixelType::LU8);
        match l.buffer() {
            PixelBuffer::U8(v) => assert_eq!(v[0], 255),
            _ => panic!("wrong storage"),
        }
    }

    #[test]
    fn test_tags_and_hdr_carry_through_convert() {
        let mut img = Image::new(ImageInfo::new(1, 1, PixelType::RgbaU8));
        img.set_tag("camera", "A");
        img.set_hdr(Some(HdrData::default()));
        let out = img.converted(PixelType::RgbaF16);
        assert_eq!(out.tag("camera"), Some("A"));
        assert!(out.hdr().is_some());
        assert_eq!(out.hdr().unwrap().white, [0.3127, 0.3290]);
    }
}
