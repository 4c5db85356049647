//! # Audio Pipeline
//!
//! The pluggable transform applied to each inbound audio frame. The relay core
//! treats audio as opaque bytes; everything format-specific lives behind the
//! [`AudioPipeline`] trait so the transform can be swapped (echo, forward,
//! transcode) without touching session management.
//!
//! ## Failure Model:
//! A pipeline distinguishes per-frame failures (the frame is dropped, the
//! session continues) from fatal failures (the session must close). The
//! session boundary enforces that distinction - see
//! [`crate::session::state::Session::submit_inbound`].

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Errors a pipeline can signal for one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Recoverable: this frame is discarded, the session stays up.
    Frame(String),
    /// Unrecoverable: the session must transition toward Closed.
    Fatal(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Frame(msg) => write!(f, "frame error: {}", msg),
            PipelineError::Fatal(msg) => write!(f, "fatal pipeline error: {}", msg),
        }
    }
}

/// A transform applied to each binary audio frame of a session.
///
/// ## Contract:
/// - `Ok(Some(bytes))`: produce an outbound frame for the client
/// - `Ok(None)`: frame consumed, nothing to send back
/// - `Err(PipelineError::Frame)`: drop this frame, keep the session alive
/// - `Err(PipelineError::Fatal)`: escalate to a session-level close
///
/// Implementations must be safe to share across sessions (`Send + Sync`);
/// per-frame state belongs in the session, not the pipeline.
pub trait AudioPipeline: Send + Sync {
    fn process(&self, data: &[u8]) -> Result<Option<Vec<u8>>, PipelineError>;

    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &'static str;
}

/// Default pipeline: returns every frame unchanged.
///
/// This is the placeholder behavior of the relay (echo for testing) and doubles
/// as the test pipeline for session-level tests.
#[derive(Debug, Default)]
pub struct EchoPipeline;

impl AudioPipeline for EchoPipeline {
    fn process(&self, data: &[u8]) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(Some(data.to_vec()))
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Echo pipeline that first checks the frame is plausible 16-bit PCM.
///
/// ## Validation Checks:
/// 1. Non-empty payload
/// 2. Even byte length (16-bit samples)
/// 3. Samples parse as little-endian i16
///
/// A frame that fails validation is a per-frame error: it is dropped and the
/// session continues.
#[derive(Debug, Default)]
pub struct ValidatedEchoPipeline;

impl ValidatedEchoPipeline {
    fn validate_pcm(&self, data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Err("audio frame is empty".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("audio frame length must be even for 16-bit samples".to_string());
        }

        let mut cursor = Cursor::new(data);
        let mut sample_count = 0usize;
        while cursor.read_i16::<LittleEndian>().is_ok() {
            sample_count += 1;
            // Checking a prefix is enough to catch truncated or garbage data.
            if sample_count >= 1000 {
                break;
            }
        }

        if sample_count == 0 {
            return Err("no valid PCM samples found".to_string());
        }

        Ok(())
    }
}

impl AudioPipeline for ValidatedEchoPipeline {
    fn process(&self, data: &[u8]) -> Result<Option<Vec<u8>>, PipelineError> {
        self.validate_pcm(data)
            .map_err(PipelineError::Frame)?;
        Ok(Some(data.to_vec()))
    }

    fn name(&self) -> &'static str {
        "validated-echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_returns_input_unchanged() {
        let pipeline = EchoPipeline;
        let out = pipeline.process(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(out, Some(vec![0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_validated_echo_accepts_pcm() {
        let pipeline = ValidatedEchoPipeline;

        // Eight 16-bit samples of a small ramp.
        let mut data = Vec::new();
        for i in 0i16..8 {
            data.extend_from_slice(&(i * 1000).to_le_bytes());
        }

        let out = pipeline.process(&data).unwrap();
        assert_eq!(out, Some(data));
    }

    #[test]
    fn test_validated_echo_rejects_odd_length() {
        let pipeline = ValidatedEchoPipeline;
        let err = pipeline.process(&[0u8; 15]).unwrap_err();
        assert!(matches!(err, PipelineError::Frame(_)));
    }

    #[test]
    fn test_validated_echo_rejects_empty() {
        let pipeline = ValidatedEchoPipeline;
        let err = pipeline.process(&[]).unwrap_err();
        assert!(matches!(err, PipelineError::Frame(_)));
    }
}
