#![allow(dead_code)]

mod harness;

pub use harness::*;
