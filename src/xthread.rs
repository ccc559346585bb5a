//! Cross-thread statics.
//!
//! The Ctrl-C handler runs on its own OS thread, outside the caller's
//! control, so it needs a process-wide way to reach the running pipeline's
//! cancellation token. The driver is handed its token explicitly by its
//! caller, so the only thing the signal handler needs to reach is that one
//! token.

use once_cell::sync::OnceCell;

use crate::cancel::CancelToken;

pub static CANCEL: OnceCell<CancelToken> = OnceCell::new();
