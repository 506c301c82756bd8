#![deny(unsafe_code)]

mod buffer;
pub mod dispatch;
mod error;

pub use buffer::*;
pub use error::*;
