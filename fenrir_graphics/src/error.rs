//! Scene-level errors and the injected debug channel.

use thiserror::Error;

use crate::device::DeviceError;

/// Errors raised while declaring or driving a [`crate::Scene`].
///
/// Declaration errors (`InvalidId`, `EmptyOutputs`, lifecycle violations) are
/// recoverable: the offending call is a no-op and the scene stays usable.
/// `Device` wraps backend failures, which are not.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error("unknown {kind} id {id}")]
    InvalidId { kind: &'static str, id: usize },
    #[error("render pass declared without outputs")]
    EmptyOutputs,
    #[error("descriptor pool already allocated")]
    PoolAlreadyAllocated,
    #[error("scene already recorded")]
    AlreadyRecorded,
    #[error("scene has not been recorded")]
    NotRecorded,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Severity attached to a [`DebugSink`] report.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Receives recoverable declaration problems as they happen.
///
/// Handed to the scene at construction; there is no global callback.
pub trait DebugSink {
    fn report(&self, severity: Severity, message: &str);
}

/// Default sink forwarding to the `log` facade.
pub struct LogSink;

impl DebugSink for LogSink {
    fn report(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => log::info!("{message}"),
            Severity::Warning => log::warn!("{message}"),
            Severity::Error => log::error!("{message}"),
        }
    }
}
