use thiserror::Error;

/// The error taxonomy of `spec.md` §7, collapsed into a single enum so every
/// facade (HTTP, socket) can map it to wire form with one `match`.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no adapter registered for kind {0:?}")]
    UnknownKind(String),

    #[error("no such run {0:?}")]
    NoSuchRun(String),

    #[error("run {0:?} is not live")]
    NotLive(String),

    #[error("run {0:?} does not support resume")]
    NotResumable(String),

    #[error("adapter misconfigured: {0}")]
    AdapterMisconfigured(String),

    #[error("adapter start exceeded deadline")]
    AdapterTimeout,

    #[error("adapter crashed: {0}")]
    AdapterCrashed(String),

    #[error("persistence store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("subscriber exceeded backpressure window")]
    Slow,

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Stable wire tag used in `run:error { error }` and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnknownKind(_) => "UnknownKind",
            DispatchError::NoSuchRun(_) => "NoSuchRun",
            DispatchError::NotLive(_) => "NotLive",
            DispatchError::NotResumable(_) => "NotResumable",
            DispatchError::AdapterMisconfigured(_) => "AdapterMisconfigured",
            DispatchError::AdapterTimeout => "AdapterTimeout",
            DispatchError::AdapterCrashed(_) => "AdapterCrashed",
            DispatchError::StoreUnavailable(_) => "StoreUnavailable",
            DispatchError::Slow => "Slow",
            DispatchError::Unauthorized => "Unauthorized",
            DispatchError::Conflict(_) => "Conflict",
            DispatchError::Io(_) => "Io",
            DispatchError::Serialization(_) => "Serialization",
        }
    }

    /// HTTP status per `spec.md` §7.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::UnknownKind(_) => 400,
            DispatchError::NoSuchRun(_) => 404,
            DispatchError::NotLive(_) => 409,
            DispatchError::NotResumable(_) => 400,
            DispatchError::AdapterMisconfigured(_) => 400,
            DispatchError::AdapterTimeout => 500,
            DispatchError::AdapterCrashed(_) => 500,
            DispatchError::StoreUnavailable(_) => 503,
            DispatchError::Slow => 409,
            DispatchError::Unauthorized => 401,
            DispatchError::Conflict(_) => 409,
            DispatchError::Io(_) => 500,
            DispatchError::Serialization(_) => 400,
        }
    }
}
