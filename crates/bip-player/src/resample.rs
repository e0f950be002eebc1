//! Sample-rate conversion for the decode pipeline.
//!
//! Uses Rubato to convert interleaved `f32` audio from the source rate to the engine rate.
//! Input is buffered into fixed-size chunks; [`StreamResampler::flush`] pushes out the
//! remainder at end of stream.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    from_hz: u32,
    to_hz: u32,
    channels: usize,
    chunk_frames: usize,
    input: Vec<f32>,
    output: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(from_hz: u32, to_hz: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let channels = channels.max(1);
        let chunk_frames = chunk_frames.max(1);
        let resampler = build_resampler(from_hz, to_hz, channels, chunk_frames)?;
        let output = vec![0.0f32; channels * resampler.output_frames_max()];
        tracing::debug!(from_hz, to_hz, channels, chunk_frames, "resampler created");
        Ok(Self {
            resampler,
            from_hz,
            to_hz,
            channels,
            chunk_frames,
            input: Vec::with_capacity(channels * chunk_frames),
            output,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    pub fn from_hz(&self) -> u32 {
        self.from_hz
    }

    pub fn to_hz(&self) -> u32 {
        self.to_hz
    }

    /// Feed interleaved input; append whatever full chunks produce to `out`.
    pub fn push(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let chunk_samples = self.chunk_frames * self.channels;
        let mut offset = 0;
        while offset < samples.len() {
            let take = (chunk_samples - self.input.len()).min(samples.len() - offset);
            self.input.extend_from_slice(&samples[offset..offset + take]);
            offset += take;
            if self.input.len() == chunk_samples {
                self.process_input(None, out)?;
            }
        }
        Ok(())
    }

    /// Resample whatever partial chunk is buffered. Call once at end of stream.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let frames = self.input.len() / self.channels;
        if frames == 0 {
            self.input.clear();
            return Ok(());
        }
        self.input.truncate(frames * self.channels);
        self.process_input(Some(frames), out)
    }

    /// Drop buffered input and filter state, e.g. after a seek.
    pub fn reset(&mut self) -> Result<()> {
        self.resampler = build_resampler(self.from_hz, self.to_hz, self.channels, self.chunk_frames)?;
        self.input.clear();
        Ok(())
    }

    fn process_input(&mut self, partial: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let frames = self.input.len() / self.channels;
        let input_adapter = InterleavedSlice::new(&self.input, self.channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e:#}"))?;
        let out_capacity_frames = self.output.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.output, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e:#}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process error: {e:#}"))?;

        out.extend_from_slice(&self.output[..nbr_out * self.channels]);
        self.input.clear();
        Ok(())
    }
}

fn build_resampler(
    from_hz: u32,
    to_hz: u32,
    channels: usize,
    chunk_frames: usize,
) -> Result<Box<dyn Resampler<f32>>> {
    if from_hz == 0 || to_hz == 0 {
        return Err(anyhow!("invalid resample rates {from_hz} -> {to_hz}"));
    }
    let f_ratio = to_hz as f64 / from_hz as f64;

    let sinc_len = 128;
    let oversampling_factor = 256;
    let interpolation = SincInterpolationType::Cubic;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);

    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation,
        oversampling_factor,
        window,
    };

    let resampler = Async::<f32>::new_sinc(
        f_ratio,
        1.1,
        &params,
        chunk_frames,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| anyhow!("resampler init error: {e:#}"))?;
    Ok(Box::new(resampler))
}
