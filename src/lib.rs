//! talking-cat-rs library crate
//!
//! This module exposes internal types for integration testing.
//! The main binary is in main.rs.

#[macro_use]
extern crate log;

pub mod capture;
pub mod character;
pub mod codec;
pub mod config;
pub mod constants;
pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod playback;
pub mod protocol;
pub mod resample;
pub mod session;
pub mod stdin;
pub mod timeline;

#[cfg(test)]
mod config_tests;
