//! Test doubles for running the pipeline without a broker or database

pub mod mocks;

pub use mocks::*;
