//! Synthesised notification beep on the default output device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, warn};

use crate::notify::{CueError, NotificationCue};

/// Short sine beep. Each play opens its own stream on a helper thread, since
/// cpal streams cannot leave the thread that built them.
#[derive(Debug, Clone)]
pub struct ToneCue {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub volume: f32,
}

impl Default for ToneCue {
    fn default() -> Self {
        Self {
            frequency_hz: 880.0,
            duration: Duration::from_millis(180),
            volume: 0.2,
        }
    }
}

impl NotificationCue for ToneCue {
    fn play(&self) -> Result<(), CueError> {
        let tone = self.clone();
        std::thread::Builder::new()
            .name("tutorlink-tone".into())
            .spawn(move || {
                if let Err(e) = tone.play_blocking() {
                    warn!(error = %e, "tone cue failed");
                }
            })
            .map_err(|e| CueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

impl ToneCue {
    fn play_blocking(&self) -> Result<(), CueError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| CueError::Unavailable("no output device".into()))?;
        let config: cpal::StreamConfig = device
            .default_output_config()
            .map_err(|e| CueError::Unavailable(e.to_string()))?
            .into();

        let sample_rate = config.sample_rate.0 as f32;
        let channels = usize::from(config.channels).max(1);
        let total_frames = (sample_rate * self.duration.as_secs_f32()) as usize;
        let step = self.frequency_hz * std::f32::consts::TAU / sample_rate;
        let volume = self.volume;
        let frame = Arc::new(AtomicUsize::new(0));

        let cursor = frame.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    for out in data.chunks_mut(channels) {
                        let n = cursor.fetch_add(1, Ordering::Relaxed);
                        let sample = if n < total_frames {
                            (n as f32 * step).sin() * volume
                        } else {
                            0.0
                        };
                        out.fill(sample);
                    }
                },
                move |err| {
                    error!("tone output error: {err}");
                },
                None,
            )
            .map_err(|e| CueError::Playback(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CueError::Playback(e.to_string()))?;
        std::thread::sleep(self.duration + Duration::from_millis(50));
        debug!(frames = frame.load(Ordering::Relaxed), "tone played");
        Ok(())
    }
}
