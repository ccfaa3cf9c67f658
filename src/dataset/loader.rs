//! Parallel sample prefetching.
//!
//! Worker threads run the assembler ahead of the consumer; results are handed
//! out strictly in index order, one sample at a time. The consumer hands out
//! jobs itself, so at most `num_workers * PREFETCH_PER_WORKER` samples are
//! being loaded or waiting to be taken at any point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::debug;

use super::assembler::SampleAssembler;
use super::index::DatasetIndex;
use super::sample::SampleRecord;

/// Samples dispatched ahead of the consumer, per worker.
const PREFETCH_PER_WORKER: usize = 2;

/// One assembled sample, or the reason it could not be assembled.
#[derive(Debug)]
pub struct LoadedSample {
    pub index: usize,
    pub sequence: String,
    pub frame: usize,
    pub result: Result<SampleRecord>,
}

type WorkerResult = (usize, Result<SampleRecord>);

enum Mode {
    /// `num_workers == 0`: load in the consumer's thread.
    Inline,
    Pooled {
        jobs: Option<Sender<usize>>,
        results: Option<Receiver<WorkerResult>>,
        pending: BTreeMap<usize, Result<SampleRecord>>,
        /// Jobs sent so far; jobs `next..dispatched` are in flight.
        dispatched: usize,
        capacity: usize,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Ordered iterator over assembled samples.
pub struct SampleLoader {
    index: Arc<DatasetIndex>,
    assembler: Arc<SampleAssembler>,
    next: usize,
    mode: Mode,
}

impl SampleLoader {
    /// Starts `num_workers` loader threads over every sample in `index`.
    pub fn new(index: Arc<DatasetIndex>, assembler: Arc<SampleAssembler>, num_workers: usize) -> Self {
        let mode = if num_workers == 0 || index.is_empty() {
            Mode::Inline
        } else {
            Self::spawn_workers(&index, &assembler, num_workers)
        };
        let mut loader = Self {
            index,
            assembler,
            next: 0,
            mode,
        };
        loader.dispatch();
        loader
    }

    fn spawn_workers(index: &Arc<DatasetIndex>, assembler: &Arc<SampleAssembler>, num_workers: usize) -> Mode {
        let capacity = num_workers * PREFETCH_PER_WORKER;
        let (job_sender, job_receiver) = unbounded::<usize>();
        let (result_sender, result_receiver) = bounded::<WorkerResult>(capacity);
        let handles = (0..num_workers)
            .map(|worker| {
                let jobs = job_receiver.clone();
                let results = result_sender.clone();
                let index = Arc::clone(index);
                let assembler = Arc::clone(assembler);
                thread::spawn(move || {
                    for i in jobs.iter() {
                        let Some(descriptor) = index.get(i) else {
                            continue;
                        };
                        let result = assembler.load_sample(descriptor);
                        if results.send((i, result)).is_err() {
                            break;
                        }
                    }
                    debug!("Loader worker {} finished", worker);
                })
            })
            .collect();

        Mode::Pooled {
            jobs: Some(job_sender),
            results: Some(result_receiver),
            pending: BTreeMap::new(),
            dispatched: 0,
            capacity,
            handles,
        }
    }

    /// Tops the in-flight jobs up to capacity. Closes the job channel once
    /// every sample is dispatched so idle workers exit.
    fn dispatch(&mut self) {
        let total = self.index.len();
        if let Mode::Pooled { jobs, dispatched, capacity, .. } = &mut self.mode {
            while *dispatched < total && *dispatched < self.next + *capacity {
                let sent = jobs.as_ref().is_some_and(|sender| sender.send(*dispatched).is_ok());
                if !sent {
                    break;
                }
                *dispatched += 1;
            }
            if *dispatched >= total {
                jobs.take();
            }
        }
    }

    /// Samples dispatched to workers and not yet taken by the consumer.
    pub fn in_flight(&self) -> usize {
        match &self.mode {
            Mode::Inline => 0,
            Mode::Pooled { dispatched, .. } => dispatched.saturating_sub(self.next),
        }
    }

    /// Finished samples waiting for the consumer.
    pub fn buffered(&self) -> usize {
        match &self.mode {
            Mode::Inline => 0,
            Mode::Pooled { results, pending, .. } => {
                pending.len() + results.as_ref().map_or(0, |r| r.len())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn next_result(&mut self, i: usize) -> Result<SampleRecord> {
        match &mut self.mode {
            Mode::Inline => match self.index.get(i) {
                Some(descriptor) => self.assembler.load_sample(descriptor),
                None => Err(anyhow::anyhow!("sample {} out of range", i)),
            },
            Mode::Pooled { results, pending, .. } => loop {
                if let Some(result) = pending.remove(&i) {
                    return result;
                }
                let received = results.as_ref().and_then(|r| r.recv().ok());
                match received {
                    Some((j, result)) => {
                        pending.insert(j, result);
                    }
                    None => return Err(anyhow::anyhow!("loader workers exited before sample {}", i)),
                }
            },
        }
    }

    /// Stops the workers and waits for them.
    pub fn shutdown(&mut self) {
        if let Mode::Pooled { jobs, results, pending, handles, .. } = &mut self.mode {
            jobs.take();
            // Dropping the receiver makes blocked workers fail their send.
            results.take();
            pending.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Iterator for SampleLoader {
    type Item = LoadedSample;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next;
        let (sequence, frame) = {
            let descriptor = self.index.get(i)?;
            (descriptor.sequence.clone(), descriptor.frame)
        };
        let result = self.next_result(i);
        self.next += 1;
        self.dispatch();
        Some(LoadedSample {
            index: i,
            sequence,
            frame,
            result,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.index.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl Drop for SampleLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
