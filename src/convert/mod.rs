pub mod output;
pub mod task;
