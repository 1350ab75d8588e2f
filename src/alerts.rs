//! Alert channels of the delivery client: sound fallback chain and desktop
//! notifications.
//!
//! No single sound mechanism is reliable, so sounds are tried in order (tone,
//! siren, bell) until one succeeds. Every channel fails on its own; a failing
//! channel never stops the others.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

pub const TONE_SAMPLE_RATE: u32 = 8_000;
pub const SIREN_SAMPLE_RATE: u32 = 22_050;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("channel disabled")]
    Disabled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("notification permission not granted")]
    PermissionDenied,

    #[error("every sound alert failed")]
    Exhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Audio
// ============================================================================

/// Sound handed to an [`AudioOutput`]
#[derive(Debug, Clone, PartialEq)]
pub enum AudioClip {
    /// `data:audio/wav;base64,...` URI
    DataUri(String),
    /// Mono 16-bit PCM
    Pcm { sample_rate: u32, samples: Vec<i16> },
}

impl AudioClip {
    /// WAV bytes of the clip
    pub fn to_wav(&self) -> Result<Vec<u8>, AlertError> {
        match self {
            AudioClip::DataUri(uri) => {
                let payload = uri
                    .strip_prefix("data:audio/wav;base64,")
                    .ok_or_else(|| AlertError::Unsupported("non-WAV data URI".into()))?;
                base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .map_err(|e| AlertError::Playback(e.to_string()))
            }
            AudioClip::Pcm {
                sample_rate,
                samples,
            } => Ok(wav_bytes(*sample_rate, samples)),
        }
    }
}

pub trait AudioOutput: Send {
    fn play(&mut self, clip: &AudioClip) -> Result<(), AlertError>;
}

/// Output for hosts without an audio player; every clip fails.
#[derive(Debug, Default)]
pub struct NoAudioOutput;

impl AudioOutput for NoAudioOutput {
    fn play(&mut self, _clip: &AudioClip) -> Result<(), AlertError> {
        Err(AlertError::Unsupported("no audio output".into()))
    }
}

/// Pipes WAV data into an external player (e.g. `aplay -q`).
#[derive(Debug, Clone)]
pub struct CommandAudioOutput {
    program: String,
    args: Vec<String>,
}

impl CommandAudioOutput {
    /// Parse a whitespace-separated command line; `None` if empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl AudioOutput for CommandAudioOutput {
    fn play(&mut self, clip: &AudioClip) -> Result<(), AlertError> {
        let wav = clip.to_wav()?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();

        // Feed and reap off the caller's thread; the child is always waited on,
        // even when it exits before reading everything
        std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&wav) {
                    debug!(error = %e, "Audio player closed its input early");
                }
            }
            if let Err(e) = child.wait() {
                debug!(error = %e, "Audio player did not exit cleanly");
            }
        });
        Ok(())
    }
}

/// Mono 16-bit PCM WAV file
pub fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

fn to_pcm(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Short 880 Hz beep with a linear fade-out
pub fn tone_samples() -> Vec<i16> {
    let len = TONE_SAMPLE_RATE as usize / 4;
    (0..len)
        .map(|i| {
            let t = i as f32 / TONE_SAMPLE_RATE as f32;
            let fade = 1.0 - i as f32 / len as f32;
            to_pcm(0.6 * fade * (TAU * 880.0 * t).sin())
        })
        .collect()
}

/// One second of three square-ish oscillators sweeping up and back down
pub fn siren_samples() -> Vec<i16> {
    const BASES: [f32; 3] = [600.0, 900.0, 1_200.0];
    let len = SIREN_SAMPLE_RATE as usize;
    let rate = SIREN_SAMPLE_RATE as f32;
    let mut phases = [0.0f32; 3];

    (0..len)
        .map(|i| {
            let progress = i as f32 / len as f32;
            // triangle sweep 1.0 -> 1.5 -> 1.0
            let sweep = 1.0 + 0.5 * (1.0 - (2.0 * progress - 1.0).abs());
            let mut mixed = 0.0;
            for (phase, base) in phases.iter_mut().zip(BASES) {
                *phase = (*phase + TAU * base * sweep / rate) % TAU;
                mixed += phase.sin().signum() * 0.2;
            }
            to_pcm(mixed)
        })
        .collect()
}

// ============================================================================
// Sound strategies
// ============================================================================

/// Sound toggles as seen by the chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoundToggles {
    pub sound_enabled: bool,
    pub pc_beep_enabled: bool,
}

pub trait AlertStrategy: Send {
    fn name(&self) -> &'static str;

    fn allowed(&self, toggles: SoundToggles) -> bool;

    fn fire(&mut self, audio: &mut dyn AudioOutput) -> Result<(), AlertError>;
}

/// Inline data-URI tone
pub struct ToneAlert {
    clip: AudioClip,
}

impl Default for ToneAlert {
    fn default() -> Self {
        let wav = wav_bytes(TONE_SAMPLE_RATE, &tone_samples());
        let uri = format!(
            "data:audio/wav;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(wav)
        );
        Self {
            clip: AudioClip::DataUri(uri),
        }
    }
}

impl AlertStrategy for ToneAlert {
    fn name(&self) -> &'static str {
        "tone"
    }

    fn allowed(&self, toggles: SoundToggles) -> bool {
        toggles.sound_enabled
    }

    fn fire(&mut self, audio: &mut dyn AudioOutput) -> Result<(), AlertError> {
        audio.play(&self.clip)
    }
}

/// Synthesized multi-oscillator siren
pub struct SirenAlert {
    clip: AudioClip,
}

impl Default for SirenAlert {
    fn default() -> Self {
        Self {
            clip: AudioClip::Pcm {
                sample_rate: SIREN_SAMPLE_RATE,
                samples: siren_samples(),
            },
        }
    }
}

impl AlertStrategy for SirenAlert {
    fn name(&self) -> &'static str {
        "siren"
    }

    fn allowed(&self, toggles: SoundToggles) -> bool {
        toggles.sound_enabled
    }

    fn fire(&mut self, audio: &mut dyn AudioOutput) -> Result<(), AlertError> {
        audio.play(&self.clip)
    }
}

/// Terminal bell ("PC beep")
pub struct BellAlert {
    out: Box<dyn Write + Send>,
    repeats: usize,
}

impl BellAlert {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, repeats: 3 }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl AlertStrategy for BellAlert {
    fn name(&self) -> &'static str {
        "bell"
    }

    fn allowed(&self, toggles: SoundToggles) -> bool {
        toggles.pc_beep_enabled
    }

    fn fire(&mut self, _audio: &mut dyn AudioOutput) -> Result<(), AlertError> {
        self.out.write_all("\x07".repeat(self.repeats).as_bytes())?;
        self.out.flush()?;
        info!("Bell alert");
        Ok(())
    }
}

/// Ordered sound fallback chain
pub struct SoundChain {
    strategies: Vec<Box<dyn AlertStrategy>>,
    audio: Box<dyn AudioOutput>,
}

impl SoundChain {
    /// Tone, then siren, then the terminal bell
    pub fn new(audio: Box<dyn AudioOutput>) -> Self {
        Self::with_strategies(
            vec![
                Box::new(ToneAlert::default()),
                Box::new(SirenAlert::default()),
                Box::new(BellAlert::stdout()),
            ],
            audio,
        )
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn AlertStrategy>>,
        audio: Box<dyn AudioOutput>,
    ) -> Self {
        Self { strategies, audio }
    }

    /// Fire strategies in order until one succeeds; returns its name.
    pub fn play(&mut self, toggles: SoundToggles) -> Result<&'static str, AlertError> {
        let mut attempted = false;
        for strategy in &mut self.strategies {
            if !strategy.allowed(toggles) {
                continue;
            }
            attempted = true;
            match strategy.fire(self.audio.as_mut()) {
                Ok(()) => return Ok(strategy.name()),
                Err(e) => debug!(strategy = strategy.name(), error = %e, "Sound alert failed"),
            }
        }

        if attempted {
            Err(AlertError::Exhausted)
        } else {
            Err(AlertError::Disabled)
        }
    }
}

// ============================================================================
// Desktop notifications
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Default,
    Granted,
    Denied,
}

pub trait DesktopNotifier: Send {
    fn permission(&self) -> Permission;

    /// Ask for permission; called only when the user enables the channel
    fn request_permission(&mut self) -> Permission;

    fn show(&mut self, title: &str, body: &str) -> Result<(), AlertError>;
}

/// Prints notifications as lines on a terminal stream
pub struct TerminalNotifier {
    out: Box<dyn Write + Send>,
    permission: Permission,
}

impl TerminalNotifier {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            permission: Permission::Default,
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    /// Restore a permission granted in an earlier run
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }
}

impl DesktopNotifier for TerminalNotifier {
    fn permission(&self) -> Permission {
        self.permission
    }

    fn request_permission(&mut self) -> Permission {
        self.permission = Permission::Granted;
        self.permission
    }

    fn show(&mut self, title: &str, body: &str) -> Result<(), AlertError> {
        if self.permission != Permission::Granted {
            return Err(AlertError::PermissionDenied);
        }
        if let Err(e) = writeln!(self.out, "[{title}] {body}") {
            warn!(error = %e, "Failed to print notification");
            return Err(e.into());
        }
        Ok(())
    }
}
