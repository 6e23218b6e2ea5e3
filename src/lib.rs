#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod endpoint_core;
pub mod endpoints {
    pub mod log;
    pub mod serial;
    pub mod tcp;
    pub mod udp;
}
pub mod error;
pub mod framing;
pub mod mainloop;
pub mod mavlink_utils;
pub mod registry;
pub mod stats;
pub mod timeout;
pub mod ulog;
