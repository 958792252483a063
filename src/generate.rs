//! Text to WAV through the model/processor pair.

use crate::error::{Error, Result};
use clap::ValueEnum;
use std::path::{Path, PathBuf};

pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Token tensors for a single prompt (batch of one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInputs {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

/// Turns raw text into model inputs.
pub trait TextProcessor {
    fn process(&self, text: &str) -> Result<ModelInputs>;
}

/// Opaque text-to-waveform model.
pub trait SpeechModel {
    fn sample_rate(&self) -> u32;
    fn generate(&mut self, inputs: &ModelInputs) -> Result<Waveform>;
}

/// Planar samples, one `Vec` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub channels: Vec<Vec<f32>>,
}

impl Waveform {
    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            channels: vec![samples],
        }
    }

    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WavEncoding {
    Pcm16,
    Float32,
}

/// Pick the first waveform out of a model output tensor.
///
/// Accepted layouts: `[samples]`, `[batch, samples]`, `[batch, channels, samples]`.
pub fn first_waveform(shape: &[i64], data: &[f32]) -> Result<Waveform> {
    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| Error::AudioShape(shape.to_vec())))
        .collect::<Result<_>>()?;
    if dims.iter().product::<usize>() != data.len() {
        return Err(Error::AudioShape(shape.to_vec()));
    }

    let waveform = match dims.as_slice() {
        [_] => Waveform::mono(data.to_vec()),
        [batch, samples] if *batch > 0 => Waveform::mono(data[..*samples].to_vec()),
        [batch, channels, samples] if *batch > 0 && *channels > 0 => Waveform {
            channels: data[..channels * samples]
                .chunks_exact(*samples.max(&1))
                .map(<[f32]>::to_vec)
                .collect(),
        },
        _ => return Err(Error::AudioShape(shape.to_vec())),
    };

    if waveform.is_empty() {
        return Err(Error::MissingAudio);
    }
    Ok(waveform)
}

pub fn write_wav(
    path: &Path,
    sample_rate: u32,
    encoding: WavEncoding,
    waveform: &Waveform,
) -> Result<()> {
    let wav_err = |source| Error::Wav {
        path: path.to_path_buf(),
        source,
    };
    let channels = waveform.channels.len() as u16;
    let spec = match encoding {
        WavEncoding::Pcm16 => hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        },
        WavEncoding::Float32 => hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        },
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for idx in 0..waveform.len() {
        for channel in &waveform.channels {
            let sample = channel[idx];
            match encoding {
                WavEncoding::Pcm16 => {
                    let clamped = sample.clamp(-1.0, 1.0);
                    writer
                        .write_sample((clamped * i16::MAX as f32) as i16)
                        .map_err(wav_err)?;
                }
                WavEncoding::Float32 => writer.write_sample(sample).map_err(wav_err)?,
            }
        }
    }
    writer.finalize().map_err(wav_err)
}

/// Synthesize `text` and write it to `output_path`.
pub fn generate_speech<M, P>(
    model: &mut M,
    processor: &P,
    text: &str,
    output_path: &Path,
    encoding: WavEncoding,
) -> Result<PathBuf>
where
    M: SpeechModel + ?Sized,
    P: TextProcessor + ?Sized,
{
    println!("Generating speech for: '{text}'");

    let inputs = processor.process(text)?;
    tracing::debug!(tokens = inputs.input_ids.len(), "processed prompt");
    let waveform = model.generate(&inputs)?;
    if waveform.is_empty() {
        return Err(Error::MissingAudio);
    }
    tracing::debug!(
        samples = waveform.len(),
        channels = waveform.channels.len(),
        "generated waveform"
    );

    write_wav(output_path, model.sample_rate(), encoding, &waveform)?;
    println!("Audio saved to: {}", output_path.display());
    Ok(output_path.to_path_buf())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Emits a short tone whose length tracks the token count.
    pub(crate) struct ToneModel {
        pub channels: usize,
        pub calls: usize,
    }

    impl SpeechModel for ToneModel {
        fn sample_rate(&self) -> u32 {
            DEFAULT_SAMPLE_RATE
        }

        fn generate(&mut self, inputs: &ModelInputs) -> Result<Waveform> {
            self.calls += 1;
            let len = inputs.input_ids.len() * 240;
            let samples: Vec<f32> = (0..len).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
            Ok(Waveform {
                channels: vec![samples; self.channels],
            })
        }
    }

    /// One token per byte; fails on the word "fail".
    pub(crate) struct ByteProcessor;

    impl TextProcessor for ByteProcessor {
        fn process(&self, text: &str) -> Result<ModelInputs> {
            if text.contains("fail") {
                return Err(Error::Tokenizer(format!("cannot encode '{text}'")));
            }
            let input_ids: Vec<i64> = text.bytes().map(i64::from).collect();
            let attention_mask = vec![1; input_ids.len()];
            Ok(ModelInputs {
                input_ids,
                attention_mask,
            })
        }
    }

    #[test]
    fn first_waveform_takes_first_batch_row() {
        let wave = first_waveform(&[2, 3], &[0.1, 0.2, 0.3, 9.0, 9.0, 9.0]).expect("2d");
        assert_eq!(wave, Waveform::mono(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn first_waveform_keeps_model_channel_count() {
        let wave = first_waveform(&[1, 2, 2], &[0.1, 0.2, 0.3, 0.4]).expect("3d");
        assert_eq!(wave.channels, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[test]
    fn first_waveform_rejects_empty_and_mismatched_output() {
        assert!(matches!(first_waveform(&[1, 0], &[]), Err(Error::MissingAudio)));
        assert!(matches!(
            first_waveform(&[1, 4], &[0.0, 0.0]),
            Err(Error::AudioShape(_))
        ));
        assert!(matches!(
            first_waveform(&[1, 1, 1, 1], &[0.0]),
            Err(Error::AudioShape(_))
        ));
    }

    #[test]
    fn generate_speech_writes_24khz_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.wav");
        let mut model = ToneModel {
            channels: 1,
            calls: 0,
        };

        let written = generate_speech(
            &mut model,
            &ByteProcessor,
            "Hello world",
            &path,
            WavEncoding::Float32,
        )
        .expect("generate");
        assert_eq!(written, path);

        let reader = hound::WavReader::open(&path).expect("open wav");
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_format, hound::SampleFormat::Float);
        assert_eq!(reader.len() as usize, "Hello world".len() * 240);
    }

    #[test]
    fn pcm16_stereo_interleaves_and_clamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        let wave = Waveform {
            channels: vec![vec![2.0, 0.0], vec![-2.0, 0.5]],
        };
        write_wav(&path, DEFAULT_SAMPLE_RATE, WavEncoding::Pcm16, &wave).expect("write");

        let mut reader = hound::WavReader::open(&path).expect("open wav");
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX, 0, (0.5 * i16::MAX as f32) as i16]);
    }

    #[test]
    fn processor_failure_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("never.wav");
        let mut model = ToneModel {
            channels: 1,
            calls: 0,
        };
        let err = generate_speech(&mut model, &ByteProcessor, "fail", &path, WavEncoding::Pcm16)
            .expect_err("should fail");
        assert!(matches!(err, Error::Tokenizer(_)));
        assert_eq!(model.calls, 0);
        assert!(!path.exists());
    }
}
