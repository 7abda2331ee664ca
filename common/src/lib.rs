pub mod cancel;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod job;
pub mod record;
pub mod results;
pub mod storage;
pub mod task;
pub mod toppages;
pub mod wordcount;
pub mod worker;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use dag::{DatasetId, DatasetNode, Graph, Shape, Transformation};
pub use errors::{EngineError, Result};
pub use job::{Action, JobInfo, JobStatus};
pub use record::{Record, Records};
pub use results::{ActionOutput, JobResult};
pub use storage::{
    OutputHandle, PartitionDescriptor, Storage, StorageReader, StorageRegistry, StorageWriter,
};
pub use task::{BlockId, BlockLocation, JobId, ResultKind, ShuffleKind, StageId, Task, TaskId, TaskInput, TaskSink};
pub use worker::{TaskError, TaskOutput, TaskReport, WorkerId, WorkerMetrics};
