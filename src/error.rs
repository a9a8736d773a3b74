#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Alias is not registered")]
    AliasNotFound,
    #[error("No backend available for alias")]
    NoBackendAvailable,
    #[error("Invalid backend address encoding")]
    InvalidBackendEncoding,
}
