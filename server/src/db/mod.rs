pub mod pool;
pub mod snapshots;
