//! Integration tests for the audio layer
//!
//! Real WAV files through symphonia demuxing, the decoder pool and the
//! decode pipeline.

use crate::test_utils::{to_le_bytes, write_f32_wav, write_garbage, write_s16_wav};
use soundboard_engine::audio::codec::SymphoniaDecoderFactory;
use soundboard_engine::audio::container::{Container, SymphoniaContainer};
use soundboard_engine::audio::device::NullDeviceFactory;
use soundboard_engine::audio::error::AudioError;
use soundboard_engine::audio::format::Encoding;
use soundboard_engine::audio::pipeline::MIN_TRAILING_CHUNK_BYTES;
use soundboard_engine::audio::{DecodePipeline, DecoderPool, Extracted, OutputSink};
use std::error::Error;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::broadcast;

#[cfg(test)]
mod audio_integration_tests {
    use super::*;

    fn sink_for(container: &dyn Container, buffer_size: usize) -> Result<OutputSink, AudioError> {
        OutputSink::build(
            Arc::new(NullDeviceFactory),
            container.format().initial_output_format(),
            buffer_size,
            100,
        )
    }

    /// Collects (audio chunks, end-of-stream chunk).
    async fn drain(pipeline: &mut DecodePipeline, sink: &mut OutputSink) -> Result<(Vec<u8>, Vec<u8>), AudioError> {
        let (_tx, mut rx) = broadcast::channel(1);
        let mut audio = Vec::new();
        loop {
            match pipeline.extract_next_buffer(sink, &mut rx).await? {
                Extracted::Chunk(bytes) => audio.extend_from_slice(&bytes),
                Extracted::EndOfStream(bytes) => return Ok((audio, bytes)),
                Extracted::Stalled => continue,
            }
        }
    }

    #[test]
    fn test_s16_wav_opens_as_raw_pcm() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("raw.wav");
        write_s16_wav(&path, 2, 250)?;

        let container = SymphoniaContainer::open(&path)?;
        let format = container.format();
        assert_eq!(format.encoding, Encoding::RawPcm16);
        assert_eq!(format.sample_rate, 44_100);
        assert_eq!(format.channels, 2);
        assert_eq!(format.duration_ms, Some(250));
        Ok(())
    }

    #[test]
    fn test_garbage_file_is_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.wav");
        write_garbage(&path)?;
        assert!(SymphoniaContainer::open(&path).is_err());
        assert!(matches!(
            SymphoniaContainer::open(&dir.path().join("absent.wav")),
            Err(AudioError::IoError(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_pipeline_passes_samples_through() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("raw.wav");
        let samples = write_s16_wav(&path, 1, 200)?;

        let container = SymphoniaContainer::open(&path)?;
        let mut sink = sink_for(&container, 8192)?;
        let mut pipeline = DecodePipeline::new(Box::new(container), None, 8192)?;

        let (audio, tail) = drain(&mut pipeline, &mut sink).await?;
        assert_eq!(audio, to_le_bytes(&samples));
        assert!(tail.is_empty());

        pipeline.rewind()?;
        let (again, _) = drain(&mut pipeline, &mut sink).await?;
        assert_eq!(again, audio);
        Ok(())
    }

    #[tokio::test]
    async fn test_float_wav_decodes_through_pool() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("float.wav");
        write_f32_wav(&path, 2, 200)?;

        let pool = DecoderPool::new(Arc::new(SymphoniaDecoderFactory));
        let container = SymphoniaContainer::open(&path)?;
        let format = container.format().clone();
        assert!(!format.is_raw());

        let lease = pool.acquire(&format).ok_or("no decoder for float wav")?;
        let mut sink = sink_for(&container, 8192)?;
        let mut pipeline = DecodePipeline::new(Box::new(container), Some(lease), 8192)?;

        let (audio, tail) = drain(&mut pipeline, &mut sink).await?;
        let frames = 44_100 * 200 / 1000;
        assert_eq!(audio.len(), frames * 2 * 2);
        assert_eq!(tail.len(), MIN_TRAILING_CHUNK_BYTES);
        assert!(tail.iter().all(|b| *b == 0));

        drop(pipeline);
        let key = format.decoder_key();
        assert_eq!(pool.idle_count(&key), 1);

        // A second stream with the same layout reuses the idle decoder.
        let second = SymphoniaContainer::open(&path)?;
        let _lease = pool.acquire(second.format()).ok_or("no decoder")?;
        assert_eq!(pool.total_count(&key), 1);
        assert_eq!(pool.idle_count(&key), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_float_wav_primes_within_buffer() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("float.wav");
        write_f32_wav(&path, 1, 500)?;

        let pool = DecoderPool::new(Arc::new(SymphoniaDecoderFactory));
        let container = SymphoniaContainer::open(&path)?;
        let lease = pool.acquire(container.format()).ok_or("no decoder")?;
        let mut sink = sink_for(&container, 4096)?;
        let mut pipeline = DecodePipeline::new(Box::new(container), Some(lease), 4096)?;

        let (_tx, mut rx) = broadcast::channel(1);
        let primed = pipeline.prime(&mut sink, &mut rx).await?;
        assert!(primed.len() >= 4096);
        assert!(!pipeline.is_finished());
        Ok(())
    }
}
