pub mod action;
pub mod canon;
pub mod context;
pub mod decider;
mod densemap;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod options;
pub mod process;
pub mod progress;
pub mod run;
pub mod scanner;
mod signal;
pub mod store;
pub mod task;
pub mod trace;
pub mod variant;
pub mod work;
