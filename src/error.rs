//! Error types for the link engine.
//!
//! This module defines the errors surfaced by session and scan handles.
//! Expected scan rejections (already scanning, missing permissions) are not
//! errors of the call; they travel through the scan sink as outcomes.

use thiserror::Error;

/// Main error type for the link engine.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Connect attempt timed out")]
   ConnectTimeout,

   #[error("Link lost unexpectedly (status {0})")]
   LinkLost(i32),

   #[error("Reconnect attempts exhausted")]
   ReconnectExhausted,

   #[error("Attribute not found")]
   AttributeNotFound,

   #[error("Operation {op} failed with code {code}")]
   OperationFailed { op: &'static str, code: i32 },

   #[error("Already connecting or connected")]
   AlreadyConnecting,

   #[error("Not connected")]
   NotConnected,

   #[error("Session has been closed")]
   SessionClosed,

   #[error("Scanner has been shut down")]
   ScannerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
