//! Catalog Ops - Batch Operations and Import Pipeline
//!
//! Runs long, multi-stage work against the staging engine:
//!
//! - **sync**: pull changed records from a source page by page, stage them,
//!   then push the source's approved changes back
//! - **update / delete**: push only
//! - **import**: upload, validate and execute a CSV file
//!
//! Operations are started and controlled through [`Supervisor`]. Workers
//! honor pause and cancel at page, batch and record boundaries, and a
//! throttled pull parks with a resume cursor instead of failing. Progress
//! and status transitions go out on the [`NotificationBus`](catalog_events::NotificationBus).

pub mod control;
pub mod import;
pub mod supervisor;

mod stage;
mod sync;
mod tracker;

pub use control::{control_channel, ControlHandle, ControlReceiver, ControlSignal};
pub use import::{parse_import, ImportPipeline, ImportRow};
pub use supervisor::Supervisor;
