pub mod errors;

pub type Result<T> = std::result::Result<T, errors::PodlensError>;

pub mod alignment;
pub mod catalog;
pub mod context;
pub mod control_plane;
pub mod correlation;
pub mod dashboard;
pub mod gateway;
pub mod model;
pub mod mutation;
pub mod quantity;
pub mod snapshot;
mod tls;
pub mod validation;
pub mod views;

pub mod prelude {
    pub use super::errors::PodlensError;
    pub use super::Result;
}
