#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

//! cinder: the build-driver core of a small C compiler.
//!
//! The driver composes preprocess, parse, semantic analysis, IR generation,
//! and linking into a concurrent DAG of build steps (`Sys` commands, `CC`
//! translation-unit compiles, `LD` joins) dispatched over a worker pool,
//! with per-step error propagation and a shared IR module per link step.

pub mod arena;
pub mod args;
pub mod config;
pub mod constants;
pub mod front;
pub mod ir;
pub mod latch;
pub mod link;
pub mod pool;
pub mod step;
mod steps;
pub mod toolchain;
pub mod ui;
pub mod unit;

pub use args::{Arch, CVersion, DriverArgs, Flavor, Subsystem, Target, TargetOs};
pub use pool::ThreadPool;
pub use step::{BuildGraph, BuildStep, StepId, StepKind};
