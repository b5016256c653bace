#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
