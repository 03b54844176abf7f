// Licensed under the Apache-2.0 license

#![allow(dead_code)]

#[path = "../../src/testing.rs"]
mod testing;

pub use testing::*;
