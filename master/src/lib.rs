//! Driver del motor: planifica etapas, despacha tareas al pool de workers,
//! aplica la política de reintentos y combina el resultado de cada acción.

pub mod aggregate;
pub mod driver;
pub mod failover;
pub mod scheduler;
pub mod state;

pub use driver::{Driver, JOB_HISTORY};
pub use scheduler::{Plan, Stage};
