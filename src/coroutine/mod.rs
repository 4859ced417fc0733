//! C5: the coroutine scheduler that bridges blocking-style handler code
//! to the non-blocking reactor/stage substrate (§4.5), plus the resume
//! plumbing the client router uses to wake a task on its owning worker.

pub mod scheduler;

pub use scheduler::{CoroContext, CoroutineScheduler, ResumeValue, TaskHandle, YieldOutcome, Yielded};
