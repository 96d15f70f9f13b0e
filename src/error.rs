use crate::backend::{BackendError, Status};

pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure classes. Callers that only care about "what went wrong"
/// rather than "which call failed" can match on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No platform or device could be discovered.
    Enumeration,
    /// The backend rejected creation of a context, queue, program, kernel or memory object.
    ResourceCreation,
    /// Kernel source failed to build.
    Compile,
    /// An operation was called in the wrong lifecycle state or with bad arguments.
    Misuse,
    /// An upload or download failed.
    Transfer,
    /// Argument binding, dispatch or queue completion failed.
    Dispatch,
    /// Invalid configuration or unreadable kernel source.
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no compute platform available")]
    NoPlatform,

    #[error("no GPU or CPU compute device available")]
    NoDevice,

    #[error("platform enumeration failed: {0}")]
    Enumeration(#[source] BackendError),

    #[error("context creation failed: {0}")]
    ContextCreationFailed(#[source] BackendError),

    #[error("command queue creation failed: {0}")]
    QueueCreationFailed(#[source] BackendError),

    #[error("kernel source is empty")]
    InvalidSource,

    #[error("program build failed ({status}):\n{log}")]
    Compile { status: Status, log: String },

    #[error("no program loaded")]
    ProgramNotLoaded,

    #[error("device not initialized")]
    NotInitialized,

    #[error("device already initialized")]
    AlreadyInitialized,

    #[error("{resource} creation failed: {source}")]
    ResourceCreation {
        resource: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("transfer failed: {0}")]
    Transfer(#[source] BackendError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[source] BackendError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn resource(resource: &'static str, source: BackendError) -> Self {
        Error::ResourceCreation { resource, source }
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoPlatform | Error::NoDevice | Error::Enumeration(_) => ErrorKind::Enumeration,
            Error::ContextCreationFailed(_)
            | Error::QueueCreationFailed(_)
            | Error::ResourceCreation { .. } => ErrorKind::ResourceCreation,
            Error::InvalidSource | Error::Compile { .. } => ErrorKind::Compile,
            Error::ProgramNotLoaded
            | Error::NotInitialized
            | Error::AlreadyInitialized
            | Error::InvalidArgument(_) => ErrorKind::Misuse,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::Dispatch(_) => ErrorKind::Dispatch,
            Error::Config(_) | Error::Io(_) => ErrorKind::Config,
        }
    }

    /// The backend status code behind this error, if it came from a backend call.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Enumeration(e)
            | Error::ContextCreationFailed(e)
            | Error::QueueCreationFailed(e)
            | Error::Transfer(e)
            | Error::Dispatch(e)
            | Error::ResourceCreation { source: e, .. } => Some(e.status),
            Error::Compile { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let backend = BackendError::new("clCreateBuffer", Status::MEM_OBJECT_ALLOCATION_FAILURE);

        assert_eq!(Error::NoPlatform.kind(), ErrorKind::Enumeration);
        assert_eq!(Error::resource("buffer", backend.clone()).kind(), ErrorKind::ResourceCreation);
        assert_eq!(Error::AlreadyInitialized.kind(), ErrorKind::Misuse);
        assert_eq!(Error::Transfer(backend.clone()).kind(), ErrorKind::Transfer);
        assert_eq!(Error::InvalidSource.kind(), ErrorKind::Compile);
        assert_eq!(
            Error::Transfer(backend).status(),
            Some(Status::MEM_OBJECT_ALLOCATION_FAILURE)
        );
        assert_eq!(Error::NotInitialized.status(), None);
    }

    #[test]
    fn test_compile_error_carries_log() {
        let err = Error::Compile {
            status: Status::BUILD_PROGRAM_FAILURE,
            log: "3: error: boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("3: error: boom"));
        assert!(text.contains("CL_BUILD_PROGRAM_FAILURE"));
    }
}
