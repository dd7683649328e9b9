//! Jobs: model, producer queue, task handlers, and the poll-loop processor.

pub mod handlers;
pub mod model;
pub mod processor;
pub mod queue;

pub use handlers::{
    AiTaskHandler, DataProcessingHandler, GenericTaskHandler, HandlerRegistry,
    MessageTaskHandler, TaskContext, TaskHandler,
};
pub use model::{Job, JobFilter, JobStatus, JobStatusUpdate, TaskKind};
pub use processor::{JobProcessor, ProcessorStatus, TickReport};
pub use queue::JobQueue;
