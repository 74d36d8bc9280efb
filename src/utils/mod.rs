//! The `utils` module provides the pieces shared across `pubsim`: the status
//! error type, logging setup, time sources and list pagination.

pub mod clock;
pub mod error;
pub mod logging;
pub mod paging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Code, Error, Result};
