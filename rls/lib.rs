#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregate;
pub mod checkpoint;
pub mod data;
pub mod factor;
pub mod kernel;
pub mod options;
pub mod perf;
pub mod wrapper;

pub use wrapper::{IcholRls, TrainError};
