pub mod error;
pub mod io;
pub mod tolerance;

pub use error::{IgaError, Result};
pub use io::TextReader;
pub use tolerance::Tolerance;
