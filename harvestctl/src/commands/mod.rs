pub mod catalog;
pub mod completions;
pub mod run;
pub mod signal;
pub mod status;
