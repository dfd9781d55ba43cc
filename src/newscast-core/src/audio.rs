//! Audio assembly: decode synthesized fragments, join them in script order with
//! silence between utterances, and encode a single MP3 track.
//!
//! Everything here is local, synchronous work. Nothing touches the network.

use std::io::Cursor;
use std::time::Duration;

use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::NewscastError;
use crate::script::SpeakerId;

pub const CONTENT_TYPE_MP3: &str = "audio/mpeg";

/// Synthesized audio for a single utterance, pre-assembly.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    /// Position of the utterance in the script.
    pub sequence: usize,
    pub speaker: SpeakerId,
    /// Encoded bytes exactly as returned by the provider.
    pub bytes: Vec<u8>,
    pub duration_hint: Option<Duration>,
}

impl AudioFragment {
    pub fn new(sequence: usize, speaker: SpeakerId, bytes: Vec<u8>) -> Self {
        let duration_hint = wav_duration(&bytes);
        Self {
            sequence,
            speaker,
            bytes,
            duration_hint,
        }
    }
}

/// Where one utterance landed in the assembled sample stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpan {
    pub sequence: usize,
    pub speaker: SpeakerId,
    /// First sample of the utterance.
    pub start: usize,
    /// Utterance length in samples.
    pub len: usize,
}

impl SegmentSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Decoded, concatenated mono samples before encoding.
#[derive(Debug, Clone)]
pub struct Mixdown {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub segments: Vec<SegmentSpan>,
}

impl Mixdown {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    /// Silent stretches between consecutive segments, as `(start, len)` pairs.
    pub fn gaps(&self) -> Vec<(usize, usize)> {
        self.segments
            .windows(2)
            .map(|pair| (pair[0].end(), pair[1].start - pair[0].end()))
            .collect()
    }
}

/// The single encoded output for one run.
#[derive(Debug, Clone)]
pub struct AssembledTrack {
    bytes: Vec<u8>,
    duration: Duration,
    segments: Vec<SegmentSpan>,
}

impl AssembledTrack {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Duration of the mixed audio before encoder padding.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn segments(&self) -> &[SegmentSpan] {
        &self.segments
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE_MP3
    }
}

/// Joins fragments into one track.
#[derive(Debug, Clone)]
pub struct AudioAssembler {
    sample_rate: u32,
    pause: Duration,
    bitrate_kbps: u32,
    /// Set when fragments are headerless s16le PCM at this rate.
    raw_pcm_rate: Option<u32>,
}

impl AudioAssembler {
    pub fn new(config: &AudioConfig) -> Result<Self, NewscastError> {
        bitrate_from_kbps(config.bitrate_kbps)?;
        Ok(Self {
            sample_rate: config.sample_rate,
            pause: config.pause(),
            bitrate_kbps: config.bitrate_kbps,
            raw_pcm_rate: None,
        })
    }

    /// Treat every fragment as headerless 16-bit little-endian mono PCM.
    pub fn with_raw_pcm(mut self, sample_rate: u32) -> Self {
        self.raw_pcm_rate = Some(sample_rate);
        self
    }

    /// Same assembler with a different pause between utterances.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Decode, order, join and encode the fragments of one run.
    pub fn assemble(&self, fragments: Vec<AudioFragment>) -> Result<AssembledTrack, NewscastError> {
        let mixdown = self.mix(fragments)?;
        let bytes = encode_mp3(&mixdown.samples, mixdown.sample_rate, self.bitrate_kbps)?;

        debug!(
            "Encoded {} segments ({:.2}s) into {} bytes",
            mixdown.segments.len(),
            mixdown.duration().as_secs_f64(),
            bytes.len()
        );

        Ok(AssembledTrack {
            bytes,
            duration: mixdown.duration(),
            segments: mixdown.segments,
        })
    }

    /// Decode and concatenate without encoding.
    ///
    /// Fragments are restored to script order by `sequence` first, since they
    /// may arrive in completion order. A single undecodable fragment fails the
    /// whole mix.
    pub fn mix(&self, mut fragments: Vec<AudioFragment>) -> Result<Mixdown, NewscastError> {
        if fragments.is_empty() {
            return Err(NewscastError::MalformedScript(
                "no audio fragments to assemble".to_string(),
            ));
        }
        fragments.sort_by_key(|f| f.sequence);

        let pause_samples = duration_to_samples(self.pause, self.sample_rate);
        let last = fragments.len() - 1;
        let mut samples = Vec::new();
        let mut segments = Vec::with_capacity(fragments.len());

        for (position, fragment) in fragments.into_iter().enumerate() {
            let decoded = match self.raw_pcm_rate {
                Some(rate) => decode_pcm_s16le(&fragment.bytes).map(|samples| (samples, rate)),
                None => decode_fragment(&fragment.bytes),
            };
            let (decoded, rate) = decoded.map_err(|message| NewscastError::FragmentDecode {
                index: fragment.sequence,
                message,
            })?;
            let decoded = resample_linear(decoded, rate, self.sample_rate);

            debug!(
                "Fragment #{} ({}): {} samples at {} Hz",
                fragment.sequence,
                fragment.speaker,
                decoded.len(),
                self.sample_rate
            );

            segments.push(SegmentSpan {
                sequence: fragment.sequence,
                speaker: fragment.speaker,
                start: samples.len(),
                len: decoded.len(),
            });
            samples.extend(decoded);

            if position < last {
                samples.resize(samples.len() + pause_samples, 0.0);
            }
        }

        Ok(Mixdown {
            samples,
            sample_rate: self.sample_rate,
            segments,
        })
    }
}

/// Decode one encoded fragment (WAV or MP3) into mono f32 samples and its rate.
pub fn decode_fragment(bytes: &[u8]) -> Result<(Vec<f32>, u32), String> {
    if bytes.is_empty() {
        return Err("fragment is empty".to_string());
    }
    if bytes.starts_with(b"RIFF") {
        return decode_wav(bytes);
    }
    decode_compressed(bytes)
}

/// Decode headerless 16-bit little-endian mono PCM.
pub fn decode_pcm_s16le(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.is_empty() {
        return Err("fragment is empty".to_string());
    }
    if bytes.len() % 2 != 0 {
        return Err(format!("PCM fragment has an odd byte count ({})", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect())
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), String> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?
        }
    };

    if interleaved.is_empty() {
        return Err("WAV fragment contains no samples".to_string());
    }
    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

fn decode_compressed(bytes: &[u8]) -> Result<(Vec<f32>, u32), String> {
    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("unrecognized audio container: {}", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| "no decodable audio track".to_string())?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("unsupported codec: {}", e))?;

    let mut samples = Vec::new();
    let mut tally = PacketTally::default();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.to_string()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend(downmix(buffer.samples(), spec.channels.count()));
                tally.decoded += 1;
            }
            // a corrupt frame inside an otherwise valid stream
            Err(SymphoniaError::DecodeError(e)) => {
                tally.skipped += 1;
                warn!("Skipping undecodable packet {}: {}", tally.total(), e);
            }
            Err(e) => return Err(e.to_string()),
        }
    }
    tally.check()?;

    if samples.is_empty() || sample_rate == 0 {
        return Err("no audio could be decoded".to_string());
    }
    Ok((samples, sample_rate))
}

/// Decoded and skipped packet counts for one compressed fragment.
#[derive(Debug, Default, Clone, Copy)]
struct PacketTally {
    decoded: usize,
    skipped: usize,
}

impl PacketTally {
    fn total(&self) -> usize {
        self.decoded + self.skipped
    }

    /// Fail once more than one packet in ten was corrupt.
    fn check(&self) -> Result<(), String> {
        if self.skipped * 10 > self.total() {
            return Err(format!(
                "{} of {} packets could not be decoded",
                self.skipped,
                self.total()
            ));
        }
        Ok(())
    }
}

/// Average interleaved channels into mono.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample using linear interpolation between adjacent samples.
pub fn resample_linear(samples: Vec<f32>, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples;
    }

    let step = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / step) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = i as f64 * step;
        let src_idx = src_pos as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        if src_idx + 1 < samples.len() {
            result.push(samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac);
        } else if src_idx < samples.len() {
            result.push(samples[src_idx]);
        }
    }

    result
}

/// Encode mono samples as a constant-bitrate MP3 stream.
pub fn encode_mp3(
    samples: &[f32],
    sample_rate: u32,
    bitrate_kbps: u32,
) -> Result<Vec<u8>, NewscastError> {
    let bitrate = bitrate_from_kbps(bitrate_kbps)?;
    let mut builder = Builder::new()
        .ok_or_else(|| NewscastError::Encode("failed to create LAME encoder".to_string()))?;
    builder
        .set_num_channels(1)
        .map_err(|e| NewscastError::Encode(format!("channels: {:?}", e)))?;
    builder
        .set_sample_rate(sample_rate)
        .map_err(|e| NewscastError::Encode(format!("sample rate {}: {:?}", sample_rate, e)))?;
    builder
        .set_brate(bitrate)
        .map_err(|e| NewscastError::Encode(format!("bitrate: {:?}", e)))?;
    builder
        .set_quality(Quality::Best)
        .map_err(|e| NewscastError::Encode(format!("quality: {:?}", e)))?;
    let mut encoder = builder
        .build()
        .map_err(|e| NewscastError::Encode(format!("init: {:?}", e)))?;

    let pcm: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();

    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
    encoder
        .encode_to_vec(MonoPcm(&pcm), &mut out)
        .map_err(|e| NewscastError::Encode(format!("encode: {:?}", e)))?;
    // LAME needs up to 7200 bytes of headroom to flush its last frames
    out.reserve(7200);
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| NewscastError::Encode(format!("flush: {:?}", e)))?;

    Ok(out)
}

fn bitrate_from_kbps(kbps: u32) -> Result<Bitrate, NewscastError> {
    let bitrate = match kbps {
        8 => Bitrate::Kbps8,
        16 => Bitrate::Kbps16,
        24 => Bitrate::Kbps24,
        32 => Bitrate::Kbps32,
        40 => Bitrate::Kbps40,
        48 => Bitrate::Kbps48,
        64 => Bitrate::Kbps64,
        80 => Bitrate::Kbps80,
        96 => Bitrate::Kbps96,
        112 => Bitrate::Kbps112,
        128 => Bitrate::Kbps128,
        160 => Bitrate::Kbps160,
        192 => Bitrate::Kbps192,
        224 => Bitrate::Kbps224,
        256 => Bitrate::Kbps256,
        320 => Bitrate::Kbps320,
        other => {
            return Err(NewscastError::ConfigError(format!(
                "Unsupported MP3 bitrate: {} kbps",
                other
            )));
        }
    };
    Ok(bitrate)
}

fn wav_duration(bytes: &[u8]) -> Option<Duration> {
    if !bytes.starts_with(b"RIFF") {
        return None;
    }
    let reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
    let rate = reader.spec().sample_rate;
    Some(samples_to_duration(reader.duration() as usize, rate))
}

fn duration_to_samples(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}

fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A mono 16-bit WAV containing a constant tone level.
    pub(crate) fn wav_bytes(samples: usize, sample_rate: u32, level: i16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..samples {
                writer.write_sample(level).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn assembler(pause_ms: u64) -> AudioAssembler {
        AudioAssembler::new(&AudioConfig {
            pause_ms,
            ..AudioConfig::default()
        })
        .unwrap()
    }

    fn fragment(sequence: usize, speaker: SpeakerId, samples: usize) -> AudioFragment {
        AudioFragment::new(sequence, speaker, wav_bytes(samples, 24_000, 8_000))
    }

    #[test]
    fn test_mix_places_n_segments_with_n_minus_one_gaps() {
        let fragments = vec![
            fragment(0, SpeakerId::AgentA, 2_400),
            fragment(1, SpeakerId::AgentB, 4_800),
            fragment(2, SpeakerId::AgentA, 1_200),
        ];
        let mix = assembler(500).mix(fragments).unwrap();

        assert_eq!(mix.segments.len(), 3);
        let gaps = mix.gaps();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|&(_, len)| len == 12_000));
        // no trailing silence
        assert_eq!(mix.samples.len(), 2_400 + 4_800 + 1_200 + 2 * 12_000);
        assert_eq!(mix.segments.last().unwrap().end(), mix.samples.len());
        // gap samples are silent
        let (start, len) = gaps[0];
        assert!(mix.samples[start..start + len].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mix_restores_script_order() {
        let fragments = vec![
            fragment(2, SpeakerId::AgentA, 100),
            fragment(0, SpeakerId::AgentA, 300),
            fragment(1, SpeakerId::AgentB, 200),
        ];
        let mix = assembler(0).mix(fragments).unwrap();

        let order: Vec<_> = mix.segments.iter().map(|s| (s.sequence, s.len)).collect();
        assert_eq!(order, vec![(0, 300), (1, 200), (2, 100)]);
        assert_eq!(mix.segments[1].speaker, SpeakerId::AgentB);
    }

    #[test]
    fn test_single_fragment_has_no_gap() {
        let mix = assembler(500)
            .mix(vec![fragment(0, SpeakerId::AgentA, 1_000)])
            .unwrap();
        assert!(mix.gaps().is_empty());
        assert_eq!(mix.samples.len(), 1_000);
    }

    #[test]
    fn test_mix_resamples_to_target_rate() {
        let fragments = vec![AudioFragment::new(
            0,
            SpeakerId::AgentA,
            wav_bytes(48_000, 48_000, 1_000),
        )];
        let mix = assembler(0).mix(fragments).unwrap();
        assert_eq!(mix.samples.len(), 24_000);
    }

    #[test]
    fn test_undecodable_fragment_aborts() {
        let fragments = vec![
            fragment(0, SpeakerId::AgentA, 100),
            AudioFragment::new(1, SpeakerId::AgentB, b"definitely not audio".to_vec()),
        ];
        let err = assembler(500).mix(fragments).unwrap_err();
        assert!(matches!(err, NewscastError::FragmentDecode { index: 1, .. }));
    }

    #[test]
    fn test_empty_fragment_list_rejected() {
        assert!(assembler(500).mix(Vec::new()).is_err());
    }

    #[test]
    fn test_duration_hint_from_wav_header() {
        let frag = fragment(0, SpeakerId::AgentA, 12_000);
        assert_eq!(frag.duration_hint, Some(Duration::from_millis(500)));
        let mp3ish = AudioFragment::new(0, SpeakerId::AgentA, vec![0xFF, 0xFB, 0x90]);
        assert_eq!(mp3ish.duration_hint, None);
    }

    #[test]
    fn test_hello_hi_there_track_duration() {
        // "Hello" (0.25s) + 500ms + "Hi there" (0.4s)
        let fragments = vec![
            fragment(0, SpeakerId::AgentA, 6_000),
            fragment(1, SpeakerId::AgentB, 9_600),
        ];
        let track = assembler(500).assemble(fragments).unwrap();

        assert_eq!(track.duration(), Duration::from_millis(1_150));
        assert_eq!(track.segments().len(), 2);
        assert_eq!(track.content_type(), "audio/mpeg");

        // the encoded stream decodes back to roughly the same length
        let (decoded, rate) = decode_fragment(track.bytes()).unwrap();
        let secs = decoded.len() as f64 / rate as f64;
        assert!((secs - 1.15).abs() < 0.15, "decoded {secs}s");
    }

    #[test]
    fn test_raw_pcm_fragments_decode_at_provider_rate() {
        let pcm: Vec<u8> = std::iter::repeat(4_000_i16.to_le_bytes())
            .take(4_800)
            .flatten()
            .collect();
        let fragments = vec![
            AudioFragment::new(0, SpeakerId::AgentA, pcm.clone()),
            AudioFragment::new(1, SpeakerId::AgentB, pcm),
        ];
        let mix = assembler(500).with_raw_pcm(24_000).mix(fragments).unwrap();

        assert_eq!(mix.segments.len(), 2);
        assert_eq!(mix.samples.len(), 4_800 * 2 + 12_000);
        assert!((mix.samples[0] - 4_000.0 / 32_768.0).abs() < 1e-6);
    }

    #[test]
    fn test_raw_pcm_resampled_and_odd_length_rejected() {
        let pcm = vec![0_u8; 48_000 * 2];
        let mix = assembler(0)
            .with_raw_pcm(48_000)
            .mix(vec![AudioFragment::new(0, SpeakerId::AgentA, pcm)])
            .unwrap();
        assert_eq!(mix.samples.len(), 24_000);

        let err = assembler(0)
            .with_raw_pcm(24_000)
            .mix(vec![AudioFragment::new(3, SpeakerId::AgentA, vec![1, 2, 3])])
            .unwrap_err();
        assert!(matches!(err, NewscastError::FragmentDecode { index: 3, .. }));
    }

    #[test]
    fn test_packet_tally_threshold() {
        let clean = PacketTally {
            decoded: 40,
            skipped: 0,
        };
        assert!(clean.check().is_ok());

        let glitch = PacketTally {
            decoded: 39,
            skipped: 1,
        };
        assert!(glitch.check().is_ok());

        let damaged = PacketTally {
            decoded: 30,
            skipped: 10,
        };
        let message = damaged.check().unwrap_err();
        assert!(message.contains("10 of 40"), "{message}");
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(samples.clone(), 24_000, 24_000), samples);
    }

    #[test]
    fn test_unsupported_bitrate() {
        let err = AudioAssembler::new(&AudioConfig {
            bitrate_kbps: 100,
            ..AudioConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, NewscastError::ConfigError(_)));
    }
}
