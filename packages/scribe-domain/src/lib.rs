pub mod action;
pub mod intent;
pub mod run;
pub mod safety;
pub mod undo;

mod error;

pub use error::{Error, Result};
