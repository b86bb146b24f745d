#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;

pub mod archive;
pub mod browser_controller;
pub mod classifier;
pub mod driver;
pub mod extractor;
pub mod listener;
pub mod runner;
pub mod types;
pub mod utils;
