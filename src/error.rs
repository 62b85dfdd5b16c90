use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipe protocol violation: {0}")]
    Protocol(&'static str),
    #[error("poller rebuild failed: {0}")]
    PollerRebuild(std::io::Error),
    #[error("reactor stopped")]
    ReactorStopped,
    #[error("reactor thread panicked")]
    ThreadPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;
