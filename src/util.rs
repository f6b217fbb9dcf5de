pub mod thread;
pub mod net;

use std::time::{Duration};

lazy_static::lazy_static! {
    /// Max time a worker blocks before checking if it must keep running.
    pub static ref SAMPLING_TIMEOUT: Duration = Duration::from_millis(50);
}
