//! Mikrofon-Capture über cpal
//!
//! Liefert Roh-PCM in einen Ring-Buffer und misst den Eingangspegel.
//! Der Mute-Status wirkt direkt im Capture-Callback - stummgeschaltete
//! Frames verlassen den Callback nicht.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 Samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Mikrofon-Capture
///
/// Note: cpal::Stream ist nicht Send, daher wrappen wir in einen
/// Send-fähigen Container und verwalten den Stream nur über start/stop.
pub struct AudioCapture {
    input_device: Option<Device>,
    input_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Mute-Status
    is_muted: Arc<Mutex<bool>>,

    /// Eingangspegel (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

// AudioCapture ist wegen Stream nicht automatisch Send
unsafe impl Send for AudioCapture {}

impl AudioCapture {
    /// Erstellt einen neuen AudioCapture über das Default-Eingabegerät
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input_device = host.default_input_device();

        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }

        Ok(Self {
            input_device,
            input_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Startet das Mikrofon-Capture
    pub fn start(&mut self) -> Result<(), AudioError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(AudioError::NoInputDevice)?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let muted = *is_muted.lock();

                    // Eingangspegel (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if muted {
                        return;
                    }

                    // Lineares Resampling auf 48kHz falls nötig
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Stoppt das Capture und gibt das Gerät frei
    pub fn stop(&mut self) {
        self.input_stream = None;
        tracing::info!("Audio capture stopped");
    }

    /// Liest einen Frame aufgenommenes Audio (20ms), falls genug vorliegt
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio capture muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Gibt den Eingangspegel zurück (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        // Priorität: 48kHz F32, sonst F32 mit nächstbester Rate
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}
