//! Microphone and speaker control, provided by the embedding application.

/// Audio device control used by the session in voice mode.
///
/// Implementations own capture and playback entirely; the session only tells
/// them when to run. Codec handling is out of scope.
#[cfg_attr(test, mockall::automock)]
pub trait AudioIo: Send + Sync {
    fn has_permission(&self) -> bool;
    fn start_recording(&self) -> anyhow::Result<()>;
    fn stop_recording(&self) -> anyhow::Result<()>;
    fn start_playback(&self) -> anyhow::Result<()>;
    fn stop_playback(&self) -> anyhow::Result<()>;
    fn is_playing(&self) -> bool;
    fn cleanup(&self) -> anyhow::Result<()>;
}

/// Audio backend for text-only sessions. Reports no permission and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAudio;

impl AudioIo for NoAudio {
    fn has_permission(&self) -> bool {
        false
    }

    fn start_recording(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop_recording(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn start_playback(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop_playback(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
