//! Register protocols of the supported chips.

pub mod door;
pub mod ht16k33;
pub mod pca9685;
