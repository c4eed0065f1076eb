//! Domain-specific error types for sandbox operations.
//!
//! Typed errors let the control loop and the orchestrator tell a fatal
//! provisioning failure apart from a recoverable patch-capture failure
//! without parsing message strings.

/// Errors that can occur during sandbox operations.
///
/// A command that exits non-zero or runs past its deadline is *not* an
/// error; those outcomes are reported through [`super::CommandResult`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found locally.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The environment could not be created or started.
    #[error("Failed to provision sandbox: {message}")]
    Provisioning { message: String },

    /// An operation was attempted before `start()` succeeded.
    #[error("Sandbox not started")]
    NotStarted,

    /// The environment became unreachable while running a command.
    #[error("Command execution failed: {message}")]
    ExecFailed { message: String },

    /// The change-set could not be extracted.
    #[error("Failed to capture patch: {message}")]
    PatchCapture { message: String },

    /// Tearing down the environment failed.
    #[error("Sandbox cleanup failed: {message}")]
    Cleanup { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `Provisioning` error.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailed` error.
    pub fn exec_failed(message: impl Into<String>) -> Self {
        Self::ExecFailed {
            message: message.into(),
        }
    }

    /// Creates a `PatchCapture` error.
    pub fn patch_capture(message: impl Into<String>) -> Self {
        Self::PatchCapture {
            message: message.into(),
        }
    }

    /// Creates a `Cleanup` error.
    pub fn cleanup(message: impl Into<String>) -> Self {
        Self::Cleanup {
            message: message.into(),
        }
    }

    /// Returns true if the environment never became usable.
    ///
    /// Docker being down and a missing image both count: neither leaves a
    /// session that can run commands.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::Provisioning { .. } | Self::DockerUnavailable { .. } | Self::ImageNotFound { .. }
        )
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if the session was used before being started.
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::NotStarted)
    }
}
