use log::{error, info};

use crate::xthread::CANCEL;

/// Initializes a system signal handler (e.g. handles CTRL+C) that fires the
/// process-wide cancellation token.
pub fn init_signal_handler() -> Result<(), String> {
    match ctrlc::set_handler(|| {
        info!("Received a termination signal in main thread");

        match CANCEL.get() {
            Some(token) => token.fire(),
            None => error!("Cannot receive the cancellation token singleton"),
        }
    }) {
        Ok(_) => Ok(()),
        Err(e) => Err(format!("Failed to init a signal handler: {}", e)),
    }
}
