//! [`Error`], [`ErrorKind`] and [`Result`].

mod http_error;
mod slot_error;

pub use http_error::{Error, ErrorKind, Result};
