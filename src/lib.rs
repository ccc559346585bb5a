//! A pipeline node runtime: discovers peers on the local network and runs a
//! chain of scripted steps over a persistent transport. See `driver` for the
//! step lifecycle, `discovery` for peer bring-up, `faninbuffer` for
//! multi-source synchronization, and `scripthost` for the embedded scripting
//! runtime bridge.

pub mod cancel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod errors;
pub mod faninbuffer;
pub mod logging;
pub mod net;
pub mod scripthost;
pub mod shutdown;
pub mod steps;
pub mod xthread;
