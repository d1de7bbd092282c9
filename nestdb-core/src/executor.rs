// src/executor.rs
// Sequential task runner: one worker thread owns the state, tasks run in FIFO order

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{NestDbError, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

struct Gate<S> {
    ready: bool,
    buffer: Vec<Job<S>>,
}

struct Inner<S> {
    sender: Sender<Job<S>>,
    gate: Mutex<Gate<S>>,
}

/// Handle to the worker thread. Cloning shares the same queue; the worker
/// stops once every handle is gone and the queue has drained.
pub struct Executor<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Executor {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Result of a pushed task
#[must_use = "a Pending does nothing unless waited on"]
pub struct Pending<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block until the task has run
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().map_err(|_| NestDbError::TaskDropped)?
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: Send + 'static> Executor<S> {
    /// Start a worker thread owning `state`. The executor starts not ready:
    /// tasks are buffered until [`Executor::process_buffer`] unless forced.
    pub fn spawn(name: &str, state: S) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job<S>>();

        let thread_name = name.to_string();
        thread::Builder::new().name(thread_name.clone()).spawn(move || {
            let mut state = state;
            debug!("executor '{}' started", thread_name);
            for job in receiver.iter() {
                job(&mut state);
            }
            debug!("executor '{}' stopped", thread_name);
        })?;

        Ok(Executor {
            inner: Arc::new(Inner {
                sender,
                gate: Mutex::new(Gate {
                    ready: false,
                    buffer: Vec::new(),
                }),
            }),
        })
    }

    /// Queue a task. Before the executor is ready the task is buffered,
    /// unless `force_queuing` is set.
    pub fn push<T, F>(&self, task: F, force_queuing: bool) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let job: Job<S> = Box::new(move |state: &mut S| {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| task(state))) {
                Ok(result) => result,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    warn!("task panicked: {}", msg);
                    Err(NestDbError::TaskPanicked(msg))
                }
            };
            // the caller may have stopped waiting
            let _ = tx.send(result);
        });

        // sending under the lock keeps FIFO order against process_buffer
        let mut gate = self.inner.gate.lock();
        if gate.ready || force_queuing {
            let _ = self.inner.sender.send(job);
        } else {
            gate.buffer.push(job);
        }

        Pending { receiver: rx }
    }

    /// Mark ready and move buffered tasks onto the queue, in order
    pub fn process_buffer(&self) {
        let mut gate = self.inner.gate.lock();
        gate.ready = true;
        let buffered = std::mem::take(&mut gate.buffer);
        if !buffered.is_empty() {
            debug!("releasing {} buffered task(s)", buffered.len());
        }
        for job in buffered {
            let _ = self.inner.sender.send(job);
        }
    }

    /// Drop every buffered task; their callers get `TaskDropped`
    pub fn reset_buffer(&self) {
        self.inner.gate.lock().buffer.clear();
    }

    /// Buffer new tasks again until the next `process_buffer`
    pub fn set_not_ready(&self) {
        self.inner.gate.lock().ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.inner.gate.lock().ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ready_executor() -> Executor<Vec<u32>> {
        let executor = Executor::spawn("test-executor", Vec::new()).unwrap();
        executor.process_buffer();
        executor
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let executor = ready_executor();
        let pendings: Vec<_> = (0..100)
            .map(|i| {
                executor.push(
                    move |log: &mut Vec<u32>| {
                        log.push(i);
                        Ok(log.len())
                    },
                    false,
                )
            })
            .collect();

        for (i, pending) in pendings.into_iter().enumerate() {
            assert_eq!(pending.wait().unwrap(), i + 1);
        }
        let log = executor.push(|log: &mut Vec<u32>| Ok(log.clone()), false).wait().unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_buffer_until_ready_and_forced_tasks() {
        let executor = Executor::spawn("buffered", Vec::new()).unwrap();
        assert!(!executor.is_ready());

        let buffered = executor.push(|log: &mut Vec<u32>| { log.push(1); Ok(()) }, false);
        let forced = executor.push(|log: &mut Vec<u32>| { log.push(0); Ok(log.clone()) }, true);

        // forced task runs even though the executor is not ready
        assert_eq!(forced.wait().unwrap(), vec![0]);

        executor.process_buffer();
        buffered.wait().unwrap();
        let log = executor.push(|log: &mut Vec<u32>| Ok(log.clone()), false).wait().unwrap();
        assert_eq!(log, vec![0, 1]);
    }

    #[test]
    fn test_failing_and_panicking_tasks_do_not_stop_the_queue() {
        let executor = ready_executor();
        let failing = executor.push(
            |_: &mut Vec<u32>| -> Result<()> { Err(NestDbError::InvalidQuery("boom".into())) },
            false,
        );
        let panicking = executor.push(|_: &mut Vec<u32>| -> Result<()> { panic!("kaboom") }, false);
        let after = executor.push(|log: &mut Vec<u32>| { log.push(7); Ok(log.len()) }, false);

        assert!(matches!(failing.wait(), Err(NestDbError::InvalidQuery(_))));
        match panicking.wait() {
            Err(NestDbError::TaskPanicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(after.wait().unwrap(), 1);
    }

    #[test]
    fn test_reset_buffer_drops_tasks() {
        let executor = ready_executor();
        executor.set_not_ready();
        let dropped = executor.push(|_: &mut Vec<u32>| Ok(()), false);
        executor.reset_buffer();
        assert!(matches!(dropped.wait(), Err(NestDbError::TaskDropped)));

        executor.process_buffer();
        assert!(executor.is_ready());
        assert!(executor.push(|_: &mut Vec<u32>| Ok(()), false).wait().is_ok());
    }

    #[test]
    fn test_pushes_from_many_threads_are_serialized() {
        let executor = ready_executor();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let executor = executor.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        executor
                            .push(
                                move |log: &mut Vec<u32>| {
                                    // read-modify-write that would race without serialization
                                    let len = log.len();
                                    thread::sleep(Duration::from_micros(10));
                                    log.push(t * 1000 + i);
                                    assert_eq!(log.len(), len + 1);
                                    Ok(())
                                },
                                false,
                            )
                            .wait()
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let log = executor.push(|log: &mut Vec<u32>| Ok(log.len()), false).wait().unwrap();
        assert_eq!(log, 400);
    }
}
