//! 🧵 Workers: the two long-running loops that actually move users around.
//!
//! 🚀 The producer pulls people out of thin air and onto the topic. The consumer
//! pulls them off the topic and into the table. They never talk to each other
//! directly; the topic is the only thing they share. Like coworkers who only
//! communicate through a shared spreadsheet. 🦆
//!
//! Each one gets everything it needs at construction (source, publisher, store,
//! checkpoint, stop signal) and owns it until it returns its report.

use anyhow::Result;
use tokio::task::JoinHandle;

pub(crate) mod consumer_worker;
pub(crate) mod producer_worker;

pub use consumer_worker::{ConsumerReport, ConsumerState};
pub use producer_worker::ProducerReport;

/// 🏗️ A background worker, that does work. duh.
///
/// `start` moves the worker onto the runtime and hands back the handle. Whatever
/// the worker has to say for itself comes back through the handle as its report.
pub(crate) trait Worker {
    type Report: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    fn start(self) -> JoinHandle<Result<Self::Report>>;
}
