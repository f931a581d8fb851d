use anyhow::{ensure, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Mono WAV reader/writer.
#[derive(Debug, Default)]
pub struct WavIo;

impl WavIo {
    /// Read a WAV file, averaging all channels into one.
    ///
    /// Returns the samples in `[-1, 1]` and the file's sample rate.
    pub fn read_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
        let path = path.as_ref();
        let mut reader = WavReader::open(path)
            .with_context(|| format!("failed to open WAV {}", path.display()))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        ensure!(channels > 0, "WAV {} has no channels", path.display());

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / max))
                    .collect::<Result<_, _>>()?
            }
        };

        let mono = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok((mono, spec.sample_rate))
    }

    /// Write mono samples as 16-bit PCM, clamping to `[-1, 1]`.
    pub fn write_mono(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
        let path = path.as_ref();
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)
            .with_context(|| format!("failed to create WAV {}", path.display()))?;
        for value in samples {
            let scaled = (value.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
        Ok(())
    }
}
