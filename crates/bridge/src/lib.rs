//! The shared-memory call bridge.
//!
//! A guest hosted on a worker thread calls back into the main thread
//! synchronously: parameters are copied into a shared transfer buffer,
//! a message announces the call, and the worker parks on the buffer's
//! futex-style lock word until the main thread writes the result into the
//! fixed header and releases it. The inverse direction is asynchronous:
//! a locked, request-at-a-time client posts work to the worker and awaits
//! its report.

mod buffer;
mod client;
mod futex;
mod host;
mod messages;
mod worker;

pub use buffer::{
    BridgeErrorCode, ResultTag, TransferBuffer, ERROR_CODE_OFFSET, HEADER_SIZE, LOCK_DONE,
    LOCK_OFFSET, LOCK_PENDING, NEXT_FREE_OFFSET, RESULT_TYPE_OFFSET, RESULT_VALUE_OFFSET,
};
pub use client::{WorkerClient, WorkerClientOptions};
pub use futex::{Futex, WaitOutcome};
pub use host::{AsyncHandler, MainDispatcher, SyncHandler};
pub use messages::{MemoryRef, Message, MessageParam, INIT_CHANNEL};
pub use worker::{bridge_imports, run_worker, WorkerConnection};
