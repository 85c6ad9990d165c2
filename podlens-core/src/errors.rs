use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct PodlensError(Box<ErrorKind>);

#[derive(Error, Debug)]
#[error(transparent)]
pub enum ErrorKind {
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("KubeClientError: {0}")]
    KubeClientError(#[from] kube::Error),
    #[error("KubeconfigError: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),
    #[error("KubeconfigInferError: {0}")]
    KubeconfigInferError(#[from] kube::config::InClusterError),
    #[error("HttpError: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("ValidationError: {0}")]
    ValidationError(String),
    #[error("UpstreamUnavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("InvalidObjectError: {0}")]
    InvalidObjectError(String),
}

impl<E> From<E> for PodlensError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        PodlensError(Box::new(ErrorKind::from(err)))
    }
}

impl PodlensError {
    pub fn validation(message: impl Into<String>) -> Self {
        PodlensError(Box::new(ErrorKind::ValidationError(message.into())))
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        PodlensError(Box::new(ErrorKind::UpstreamUnavailable(message.into())))
    }

    pub fn invalid_object(message: impl Into<String>) -> Self {
        PodlensError(Box::new(ErrorKind::InvalidObjectError(message.into())))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub fn is_validation(&self) -> bool {
        matches!(*self.0, ErrorKind::ValidationError(_))
    }
}
