#![forbid(unsafe_code)]

//! Shared library for the vidfetch binaries.

pub mod config;
pub mod fetcher;
pub mod security;
pub mod storage;
