use thiserror::Error;

use crate::domain::directory::DirectoryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: `{0}`")]
    InvalidConfiguration(String),
    #[error("Directory error: `{0}`")]
    Directory(#[from] DirectoryError),
}

pub type Result<T> = std::result::Result<T, Error>;
