pub mod cancel;
pub mod pool;
