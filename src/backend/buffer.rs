//! Coded buffers handed to backend decoders

use std::time::Duration;

/// Opaque content-decryption context
///
/// The pipeline never interprets it; sub-pipelines attach a copy to every
/// encrypted buffer they push.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CdmHandle {
    id: u64,
}

impl CdmHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Per-buffer decryption metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptConfig {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
}

/// One coded frame, or the end-of-stream marker
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderBuffer {
    /// Presentation timestamp
    pub timestamp: Duration,

    /// Frame duration
    pub duration: Duration,

    /// Coded payload
    pub data: Vec<u8>,

    /// End-of-stream marker; carries no payload
    pub end_of_stream: bool,

    /// Present when the payload is encrypted
    pub decrypt_config: Option<DecryptConfig>,

    /// Decryption context attached by the sub-pipeline before pushing
    pub decrypt_context: Option<CdmHandle>,
}

impl DecoderBuffer {
    /// Clear buffer carrying `data`
    pub fn new(timestamp: Duration, duration: Duration, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            duration,
            data,
            end_of_stream: false,
            decrypt_config: None,
            decrypt_context: None,
        }
    }

    /// End-of-stream marker
    pub fn end_of_stream() -> Self {
        Self {
            timestamp: Duration::ZERO,
            duration: Duration::ZERO,
            data: Vec::new(),
            end_of_stream: true,
            decrypt_config: None,
            decrypt_context: None,
        }
    }

    /// Mark the buffer as encrypted
    pub fn with_decrypt_config(mut self, decrypt_config: DecryptConfig) -> Self {
        self.decrypt_config = Some(decrypt_config);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.decrypt_config.is_some()
    }

    /// Timestamp just past the end of this frame
    pub fn end_time(&self) -> Duration {
        self.timestamp + self.duration
    }
}
