use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Resource Load Failed: {0}")]
    ResourceLoad(String),

    #[error("Decode Failed: {0}")]
    Decode(String),

    #[error("Inference Failed: {0}")]
    Inference(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Service Rejected Request: {0}")]
    ServiceRejected(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_service_rejection(&self) -> bool {
        matches!(self, Self::ServiceRejected(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(detail) => format!("Could not reach the service: {detail}"),
            Self::ServiceRejected(detail) => format!("The service rejected the request: {detail}"),
            Self::Decode(detail) => format!("The image could not be read: {detail}"),
            Self::Image(err) => format!("The image could not be read: {err}"),
            Self::ResourceLoad(detail) => format!("The classifier is unavailable: {detail}"),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
