#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bitmask;
pub mod codec;
pub mod collab;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod ids;
pub mod session;
pub mod timer;

pub mod prelude;

#[cfg(any(test, feature = "mocks"))]
pub mod testutil;
