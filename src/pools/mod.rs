mod worker;

pub use worker::{spawn_worker_pool, PoolStats, StatsSummary};
