use thiserror::Error;

/// Failure kinds of the setup and build stages. Every variant aborts the
/// running stage; the message names the file, URL or step involved.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(what: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io(format!("{what}: {err}"))
    }

    /// Prefix the message while keeping the error kind.
    pub fn context(self, prefix: impl std::fmt::Display) -> Self {
        match self {
            Self::Config(m) => Self::Config(format!("{prefix}: {m}")),
            Self::Network(m) => Self::Network(format!("{prefix}: {m}")),
            Self::Archive(m) => Self::Archive(format!("{prefix}: {m}")),
            Self::LayoutMismatch(m) => Self::LayoutMismatch(format!("{prefix}: {m}")),
            Self::Precondition(m) => Self::Precondition(format!("{prefix}: {m}")),
            Self::Io(m) => Self::Io(format!("{prefix}: {m}")),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 2,
            Self::Archive(_) => 3,
            Self::LayoutMismatch(_) => 4,
            Self::Precondition(_) => 5,
            Self::Io(_) => 6,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
