pub mod std_adapters;

pub use std_adapters::{FixedTimeAdapter, MapEnvAdapter, StdEnvAdapter, StdTimeAdapter};
