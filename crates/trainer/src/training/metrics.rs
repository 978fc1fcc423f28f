//! Metric sinks and image-frame conversion for experiment tracking.

use burn::prelude::*;

/// An RGB8 frame converted from a rendered image tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<u8>,
}

/// Experiment-tracking sink: named scalars and preview frames keyed by
/// training step. The backing service is external; implementations only
/// forward.
pub trait MetricSink {
    fn log_scalars(&mut self, entries: &[(String, f64)], step: u64);
    fn log_frames(&mut self, name: &str, frames: &[ImageFrame], step: u64);
}

/// Sink that forwards scalars to the tracing log and drops frame payloads
/// (their dimensions are still recorded).
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_scalars(&mut self, entries: &[(String, f64)], step: u64) {
        for (name, value) in entries {
            tracing::info!(step, metric = %name, value, "scalar");
        }
    }

    fn log_frames(&mut self, name: &str, frames: &[ImageFrame], step: u64) {
        if let Some(first) = frames.first() {
            tracing::info!(
                step,
                name,
                count = frames.len(),
                width = first.width,
                height = first.height,
                "frames"
            );
        }
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// `(step, metric name, value)` in arrival order.
    pub scalars: Vec<(u64, String, f64)>,
    /// `(step, stream name, frame count)` in arrival order.
    pub frames: Vec<(u64, String, usize)>,
}

impl MetricSink for MemorySink {
    fn log_scalars(&mut self, entries: &[(String, f64)], step: u64) {
        for (name, value) in entries {
            self.scalars.push((step, name.clone(), *value));
        }
    }

    fn log_frames(&mut self, name: &str, frames: &[ImageFrame], step: u64) {
        self.frames.push((step, name.to_string(), frames.len()));
    }
}

/// Clamp a `[3, height, width]` image to `[0, 1]` and convert to RGB8.
pub fn image_to_frame<B: Backend>(image: Tensor<B, 3>) -> anyhow::Result<ImageFrame> {
    let [channels, height, width] = image.dims();
    anyhow::ensure!(channels == 3, "expected an RGB image, got {channels} channels");
    let data: Vec<f32> = image
        .clamp(0.0, 1.0)
        .into_data()
        .to_vec()
        .map_err(|err| anyhow::anyhow!("reading image tensor: {err:?}"))?;
    let mut rgb = vec![0u8; height * width * 3];
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                let value = data[c * height * width + y * width + x];
                rgb[(y * width + x) * 3 + c] = (value * 255.0).round() as u8;
            }
        }
    }
    Ok(ImageFrame { width, height, rgb })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_image_to_frame_clamps_and_scales() {
        let device = Default::default();
        // One 1x2 image: channel values include out-of-range extremes.
        let image = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(
                vec![
                    -1.0_f32, 0.5, // red
                    2.0, 0.0, // green
                    1.0, 0.25, // blue
                ],
                [3, 1, 2],
            ),
            &device,
        );
        let frame = image_to_frame(image).unwrap();
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.rgb, vec![0, 255, 255, 128, 0, 64]);
    }

    #[test]
    fn test_image_to_frame_rejects_non_rgb() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 3>::zeros([1, 4, 4], &device);
        assert!(image_to_frame(image).is_err());
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let mut sink = MemorySink::default();
        sink.log_scalars(&[("a".to_string(), 1.0), ("b".to_string(), 2.0)], 5);
        sink.log_frames("preview", &[], 5);
        assert_eq!(sink.scalars.len(), 2);
        assert_eq!(sink.scalars[0], (5, "a".to_string(), 1.0));
        assert_eq!(sink.frames, vec![(5, "preview".to_string(), 0)]);
    }
}
