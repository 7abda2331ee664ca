mod fault;
mod pool;
mod store;
mod worker;

pub use fault::FaultPlan;
pub use pool::WorkerPool;
pub use store::BlockStore;
pub use worker::Worker;
