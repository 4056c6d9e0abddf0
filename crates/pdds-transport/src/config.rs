// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Transport configuration.
//!
//! A [`TransportConfig`] is produced by the configuration layer (out of
//! scope here), handed to a [`crate::TransportInstance`] exactly once via
//! `configure()`, and treated as immutable afterwards -- it is shared as
//! `Arc<dyn TransportConfig>` between the instance and every link it
//! creates, and read without locking.
//!
//! Each concrete plugin defines its own config type embedding a
//! [`CommonConfig`]; the plugin recovers its concrete type with
//! [`downcast_config`], which turns a wrong-type supply into a logged
//! `InvalidConfig` failure instead of a panic.

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, TransportError};

// ============================================================================
// Common settings
// ============================================================================

/// Settings every transport kind shares.
#[derive(Clone, Debug)]
pub struct CommonConfig {
    /// Local address/port for this transport (port 0 = ephemeral)
    pub local_address: SocketAddr,

    /// How long a link may stay in backpressure before it is declared lost
    /// (`None` = never escalate)
    pub max_output_pause: Option<Duration>,

    /// Sizing hint for per-link send queues (messages)
    pub send_queue_capacity: usize,

    /// Sizing hint for receive buffers (bytes)
    pub recv_buffer_size: usize,

    /// Demarshal multi-byte wire fields with swapped byte order
    pub swap_bytes: bool,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            local_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            max_output_pause: Some(Duration::from_secs(10)),
            send_queue_capacity: 64,
            recv_buffer_size: 64 * 1024,
            swap_bytes: false,
        }
    }
}

impl CommonConfig {
    /// Validate the common settings.
    ///
    /// Called by `TransportInstance::configure` before the plugin sees the
    /// config; a failed validation leaves the instance unconfigured.
    pub fn validate(&self) -> Result<()> {
        if self.send_queue_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "send_queue_capacity must be non-zero".into(),
            ));
        }
        if self.recv_buffer_size == 0 {
            return Err(TransportError::InvalidConfig(
                "recv_buffer_size must be non-zero".into(),
            ));
        }
        if let Some(pause) = self.max_output_pause {
            if pause.is_zero() {
                return Err(TransportError::InvalidConfig(
                    "max_output_pause must be non-zero; use None to disable".into(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Plugin-facing trait
// ============================================================================

/// One configured transport's resolved settings.
///
/// Implemented by each plugin's config type. Immutable after
/// `TransportInstance::configure`.
pub trait TransportConfig: Send + Sync + 'static {
    /// The settings shared by every transport kind.
    fn common(&self) -> &CommonConfig;

    /// Downcast support for plugin-specific settings.
    fn as_any(&self) -> &dyn Any;
}

/// Recover a plugin's concrete config type.
///
/// Returns `InvalidConfig` when the instance was configured with a config
/// built for a different transport kind.
pub fn downcast_config<T: TransportConfig>(config: &dyn TransportConfig) -> Result<&T> {
    config.as_any().downcast_ref::<T>().ok_or_else(|| {
        log::error!(
            "[CONFIG] configuration type mismatch: expected {}",
            std::any::type_name::<T>()
        );
        TransportError::InvalidConfig(format!(
            "configuration type mismatch: expected {}",
            std::any::type_name::<T>()
        ))
    })
}
