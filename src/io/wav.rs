//! WAV audio plugin
//!
//! Decoding runs through symphonia's wav demuxer and PCM codec; sample
//! data converts to engine formats on copy-out (unsigned 8-bit recenters
//! to `S8`, 24-bit widens to `S32`). The stream probes synchronously at
//! open; sample reads run on the shared worker pool. Writing stays a
//! plain RIFF emitter for fixtures and tools.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use symphonia::core::audio::SampleBuffer as SymSampleBuffer;
use symphonia::core::codecs::{
    CODEC_TYPE_NULL, CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64BE,
    CODEC_TYPE_PCM_F64LE, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE,
    CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_S8,
    CODEC_TYPE_PCM_U8, CodecType, Decoder, DecoderOptions,
};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::audio::{Audio, AudioInfo, AudioType, SampleBuffer};
use crate::core::workers::Workers;
use crate::error::{Error, Result};
use crate::io::{
    AudioData, AudioLayer, FileType, IoPlugin, Options, Pending, Reader, ReaderInfo, VideoData,
    pending,
};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};

pub fn plugin(workers: Arc<Workers>) -> Arc<dyn IoPlugin> {
    Arc::new(WavPlugin { workers })
}

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;

pub struct WavPlugin {
    workers: Arc<Workers>,
}

impl IoPlugin for WavPlugin {
    fn name(&self) -> &str {
        "wav"
    }

    fn extensions(&self) -> &[&str] {
        &["wav"]
    }

    fn file_type(&self) -> FileType {
        FileType::Audio
    }

    fn read(&self, path: &Path, _options: &Options) -> Result<Box<dyn Reader>> {
        let file = path.full();
        let spec = WavDecoder::open(&file)?.spec;
        debug!("opened {}: {} ({} samples)", file, spec.info, spec.sample_count);
        Ok(Box::new(WavReader {
            file,
            spec,
            workers: Arc::clone(&self.workers),
            epoch: Arc::new(AtomicU64::new(0)),
        }))
    }
}

/// Probed stream shape; read jobs open their own decoder
#[derive(Debug, Clone, Copy)]
struct WavSpec {
    info: AudioInfo,
    sample_count: u64,
}

impl WavSpec {
    fn range(&self) -> TimeRange {
        let rate = self.info.sample_rate as f64;
        TimeRange::new(RationalTime::new(0.0, rate), RationalTime::new(self.sample_count as f64, rate))
    }
}

/// Demuxer plus PCM decoder over one open file
struct WavDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: WavSpec,
}

impl WavDecoder {
    fn open(path: &str) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| Error::OpenFailed(format!("'{}': {}", path, e)))?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = std::path::Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
            .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::OpenFailed(format!("'{}': {}", path, e)))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.channels.is_some())
            .ok_or_else(|| Error::OpenFailed(format!("'{}': no decodable audio track", path)))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let audio_type = audio_type_of(params.codec).ok_or_else(|| {
            Error::OpenFailed(format!("'{}': unsupported codec {:?}", path, params.codec))
        })?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|&c| c > 0)
            .ok_or_else(|| Error::OpenFailed(format!("'{}': no channel layout", path)))?;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::OpenFailed(format!("'{}': no sample rate", path)))?;
        let sample_count = params
            .n_frames
            .ok_or_else(|| Error::OpenFailed(format!("'{}': unknown stream length", path)))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::OpenFailed(format!("'{}': {}", path, e)))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            spec: WavSpec {
                info: AudioInfo::new(channels, sample_rate, audio_type),
                sample_count,
            },
        })
    }

    /// Decode `count` interleaved frames starting at frame `start`
    ///
    /// Seeks are coarse; packets get trimmed to the window by their
    /// timestamps, so the first packet may begin before `start`.
    fn decode_window<T: ConvertibleSample>(&mut self, start: u64, count: usize) -> Result<Vec<T>> {
        let channels = self.spec.info.channel_count;
        let rate = self.spec.info.sample_rate as f64;
        let end = start + count as u64;

        self.reader
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(start as f64 / rate),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::DecodeFailed(format!("seek to sample {}: {}", start, e)))?;
        self.decoder.reset();

        let mut out: Vec<T> = Vec::with_capacity(count * channels);
        let mut cursor = start;
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(Error::DecodeFailed(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let first = packet.ts();
            if first >= end {
                break;
            }
            let decoded =
                self.decoder.decode(&packet).map_err(|e| Error::DecodeFailed(e.to_string()))?;
            let frames = decoded.frames() as u64;
            if first + frames <= cursor {
                continue;
            }
            let spec = *decoded.spec();
            let mut buf = SymSampleBuffer::<T>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            let skip = cursor.saturating_sub(first) as usize;
            let take = (end.min(first + frames) - cursor.max(first)) as usize;
            let samples = buf.samples();
            out.extend_from_slice(&samples[skip * channels..(skip + take) * channels]);
            cursor = first + (skip + take) as u64;
        }

        if out.len() != count * channels {
            return Err(Error::DecodeFailed(format!(
                "sample data truncated at {} of {} samples",
                out.len(),
                count * channels
            )));
        }
        Ok(out)
    }
}

/// Engine sample format for a PCM codec
fn audio_type_of(codec: CodecType) -> Option<AudioType> {
    if codec == CODEC_TYPE_PCM_U8 || codec == CODEC_TYPE_PCM_S8 {
        Some(AudioType::S8)
    } else if codec == CODEC_TYPE_PCM_S16LE || codec == CODEC_TYPE_PCM_S16BE {
        Some(AudioType::S16)
    } else if codec == CODEC_TYPE_PCM_S24LE
        || codec == CODEC_TYPE_PCM_S24BE
        || codec == CODEC_TYPE_PCM_S32LE
        || codec == CODEC_TYPE_PCM_S32BE
    {
        Some(AudioType::S32)
    } else if codec == CODEC_TYPE_PCM_F32LE || codec == CODEC_TYPE_PCM_F32BE {
        Some(AudioType::F32)
    } else if codec == CODEC_TYPE_PCM_F64LE || codec == CODEC_TYPE_PCM_F64BE {
        Some(AudioType::F64)
    } else {
        None
    }
}

/// Open, seek, and decode one interleaved block
fn decode_block(path: &str, start: u64, count: usize) -> Result<Audio> {
    let mut decoder = WavDecoder::open(path)?;
    let info = decoder.spec.info;
    let buffer = match info.audio_type {
        AudioType::S8 => SampleBuffer::S8(decoder.decode_window::<i8>(start, count)?),
        AudioType::S16 => SampleBuffer::S16(decoder.decode_window::<i16>(start, count)?),
        AudioType::S32 => SampleBuffer::S32(decoder.decode_window::<i32>(start, count)?),
        AudioType::F32 => SampleBuffer::F32(decoder.decode_window::<f32>(start, count)?),
        AudioType::F64 => SampleBuffer::F64(decoder.decode_window::<f64>(start, count)?),
    };
    Ok(Audio::from_buffer(info, buffer))
}

struct WavReader {
    file: String,
    spec: WavSpec,
    workers: Arc<Workers>,
    /// Bumped by `cancel_requests`; jobs snapshot it at submission
    epoch: Arc<AtomicU64>,
}

impl Reader for WavReader {
    fn info(&mut self) -> Pending<ReaderInfo> {
        Pending::ready(Ok(ReaderInfo {
            audio: Some(self.spec.info),
            audio_range: Some(self.spec.range()),
            ..Default::default()
        }))
    }

    fn read_video(&mut self, _time: RationalTime, _options: &Options) -> Pending<VideoData> {
        Pending::ready(Err(Error::InvalidArgument(format!(
            "'{}' carries no video",
            self.file
        ))))
    }

    fn read_audio(&mut self, range: TimeRange, _options: &Options) -> Pending<AudioData> {
        let served = match self.spec.range().intersection(&range) {
            Some(r) => r,
            None => {
                return Pending::ready(Err(Error::OutOfRange(format!(
                    "{} at {}s",
                    self.file,
                    range.start.to_seconds()
                ))));
            }
        };
        let rate = self.spec.info.sample_rate as f64;
        let start = served.start.rescaled_to(rate).value.round().max(0.0) as u64;
        let count = served.duration.rescaled_to(rate).value.round() as usize;

        let (completion, out) = pending();
        let file = self.file.clone();
        let epoch = Arc::clone(&self.epoch);
        let submitted = epoch.load(Ordering::Relaxed);

        self.workers.execute(move || {
            if epoch.load(Ordering::Relaxed) != submitted {
                return; // dropped completion reads as Cancelled
            }
            let result = decode_block(&file, start, count).map(|audio| AudioData {
                time: served.start,
                layers: vec![AudioLayer { audio: Some(Arc::new(audio)) }],
            });
            if epoch.load(Ordering::Relaxed) == submitted {
                completion.complete(result);
            }
        });
        out
    }

    fn cancel_requests(&mut self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }
}

/// Write an interleaved block as a PCM/float WAV file
///
/// Writers in the I/O contract are frame-based; audio files are written
/// whole, so this sits outside the plugin surface (tests and tools).
pub fn write_file(path: &str, audio: &Audio) -> Result<()> {
    use std::io::Write as _;

    let info = audio.info();
    let (format, bits): (u16, u16) = match info.audio_type {
        AudioType::S8 => (FORMAT_PCM, 8),
        AudioType::S16 => (FORMAT_PCM, 16),
        AudioType::S32 => (FORMAT_PCM, 32),
        AudioType::F32 => (FORMAT_FLOAT, 32),
        AudioType::F64 => (FORMAT_FLOAT, 64),
    };
    let block_align = info.channel_count as u16 * (bits / 8);
    let byte_rate = info.sample_rate * block_align as u32;

    // S8 recenters to the unsigned 8-bit disk form
    let payload: Vec<u8> = match audio.buffer() {
        SampleBuffer::S8(v) => v.iter().map(|&s| (s as i16 + 128) as u8).collect(),
        other => other.bytes().to_vec(),
    };

    let mut out = std::io::BufWriter::new(File::create(path)?);
    out.write_all(b"RIFF")?;
    out.write_all(&(36 + payload.len() as u32).to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&format.to_le_bytes())?;
    out.write_all(&(info.channel_count as u16).to_le_bytes())?;
    out.write_all(&info.sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&bits.to_le_bytes())?;
    out.write_all(b"data")?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.flush()?;
    Ok(())
}
