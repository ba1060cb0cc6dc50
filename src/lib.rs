#[macro_use]
extern crate async_trait;

#[cfg(test)]
pub(crate) mod test_util;

pub mod agent;
pub mod configuration;
pub mod error;
pub mod executor;
pub mod recorder;
pub mod run;
pub mod throttle;
pub mod workload;
