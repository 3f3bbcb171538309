//! Audio buffers and formats
//!
//! **Why**: Audio moves through the engine as interleaved typed blocks keyed
//! by time range, the sample-side twin of `image::Image`.
//!
//! **Used by**: WAV/movie readers, read-ahead pipeline (audio window),
//! player (published audio, volume/mute application)

use serde::{Deserialize, Serialize};

use crate::time::RationalTime;

/// Sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioType {
    S8,
    S16,
    S32,
    F32,
    F64,
}

impl AudioType {
    pub fn byte_count(&self) -> usize {
        match self {
            AudioType::S8 => 1,
            AudioType::S16 => 2,
            AudioType::S32 | AudioType::F32 => 4,
            AudioType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, AudioType::F32 | AudioType::F64)
    }
}

/// Shape of an audio block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channel_count: usize,
    pub sample_rate: u32,
    pub audio_type: AudioType,
}

impl AudioInfo {
    pub fn new(channel_count: usize, sample_rate: u32, audio_type: AudioType) -> Self {
        Self { channel_count, sample_rate, audio_type }
    }

    pub fn is_valid(&self) -> bool {
        self.channel_count > 0 && self.sample_rate > 0
    }

    /// Bytes for one interleaved sample across all channels
    pub fn frame_byte_count(&self) -> usize {
        self.channel_count * self.audio_type.byte_count()
    }
}

impl std::fmt::Display for AudioInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ch {}Hz {:?}", self.channel_count, self.sample_rate, self.audio_type)
    }
}

/// Typed interleaved sample storage
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    S8(Vec<i8>),
    S16(Vec<i16>),
    S32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl SampleBuffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            SampleBuffer::S8(v) => bytemuck::cast_slice(v),
            SampleBuffer::S16(v) => bytemuck::cast_slice(v),
            SampleBuffer::S32(v) => bytemuck::cast_slice(v),
            SampleBuffer::F32(v) => bytemuck::cast_slice(v),
            SampleBuffer::F64(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::S8(v) => v.len(),
            SampleBuffer::S16(v) => v.len(),
            SampleBuffer::S32(v) => v.len(),
            SampleBuffer::F32(v) => v.len(),
            SampleBuffer::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owning interleaved audio block
#[derive(Debug, Clone)]
pub struct Audio {
    info: AudioInfo,
    buffer: SampleBuffer,
}

impl Audio {
    /// Silence of `sample_count` frames
    pub fn silence(info: AudioInfo, sample_count: usize) -> Self {
        let n = sample_count * info.channel_count;
        let buffer = match info.audio_type {
            AudioType::S8 => SampleBuffer::S8(vec![0; n]),
            AudioType::S16 => SampleBuffer::S16(vec![0; n]),
            AudioType::S32 => SampleBuffer::S32(vec![0; n]),
            AudioType::F32 => SampleBuffer::F32(vec![0.0; n]),
            AudioType::F64 => SampleBuffer::F64(vec![0.0; n]),
        };
        Self { info, buffer }
    }

    /// Adopt an existing buffer; length must be a whole number of frames
    pub fn from_buffer(info: AudioInfo, buffer: SampleBuffer) -> Self {
        debug_assert_eq!(buffer.len() % info.channel_count.max(1), 0);
        Self { info, buffer }
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Frames per channel
    pub fn sample_count(&self) -> usize {
        self.buffer.len() / self.info.channel_count.max(1)
    }

    pub fn byte_count(&self) -> usize {
        self.buffer.bytes().len()
    }

    pub fn duration(&self) -> RationalTime {
        RationalTime::new(self.sample_count() as f64, self.info.sample_rate as f64)
    }

    /// Scale every sample; integer formats saturate
    pub fn apply_gain(&mut self, gain: f32) {
        match &mut self.buffer {
            SampleBuffer::S8(v) => {
                for s in v.iter_mut() {
                    *s = (*s as f32 * gain).clamp(i8::MIN as f32, i8::MAX as f32) as i8;
                }
            }
            SampleBuffer::S16(v) => {
                for s in v.iter_mut() {
                    *s = (*s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                }
            }
            SampleBuffer::S32(v) => {
                for s in v.iter_mut() {
                    *s = (*s as f64 * gain as f64).clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                }
            }
            SampleBuffer::F32(v) => {
                for s in v.iter_mut() {
                    *s *= gain;
                }
            }
            SampleBuffer::F64(v) => {
                for s in v.iter_mut() {
                    *s *= gain as f64;
                }
            }
        }
    }

    /// Zero out the channels flagged `true`; extra flags are ignored
    pub fn mute_channels(&mut self, muted: &[bool]) {
        let ch = self.info.channel_count;
        macro_rules! mute {
            ($vec:expr, $zero:expr) => {
                for (i, s) in $vec.iter_mut().enumerate() {
                    if muted.get(i % ch).copied().unwrap_or(false) {
                        *s = $zero;
                    }
                }
            };
        }
        match &mut self.buffer {
            SampleBuffer::S8(v) => mute!(v, 0),
            SampleBuffer::S16(v) => mute!(v, 0),
            SampleBuffer::S32(v) => mute!(v, 0),
            SampleBuffer::F32(v) => mute!(v, 0.0),
            SampleBuffer::F64(v) => mute!(v, 0.0),
        }
    }
}
