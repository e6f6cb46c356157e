//! Per-endpoint command queue with time slicing.
//!
//! ```text
//! queue_command(endpoints, cmd)
//!     │
//!     ├─ ProcessAll + empty queue ─► run now
//!     └─ otherwise ─► endpoint FIFO ─► process_queue(budget) each tick
//!                                        ├─ ProcessAll: drain
//!                                        └─ TimeSliced: round-robin until budget spent
//! ```
//!
//! A joining endpoint's history replay runs time-sliced so it cannot stall
//! the session; once its queue drains it reverts to `ProcessAll` and is
//! reported as completed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_core::EndpointId;

/// A deferred unit of work for one endpoint, run against the context `C`.
pub type SyncCommand<C> = Arc<dyn Fn(&mut C, EndpointId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMethod {
    /// Run commands as soon as possible
    #[default]
    ProcessAll,
    /// Run commands round-robin within the per-tick budget
    ProcessTimeSliced,
}

struct EndpointQueue<C> {
    method: ProcessingMethod,
    commands: VecDeque<SyncCommand<C>>,
}

impl<C> Default for EndpointQueue<C> {
    fn default() -> Self {
        Self {
            method: ProcessingMethod::default(),
            commands: VecDeque::new(),
        }
    }
}

pub struct SyncCommandQueue<C> {
    queues: BTreeMap<EndpointId, EndpointQueue<C>>,
}

impl<C> Default for SyncCommandQueue<C> {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }
}

impl<C> SyncCommandQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_command_processing_method(&mut self, endpoint: EndpointId, method: ProcessingMethod) {
        self.queues.entry(endpoint).or_default().method = method;
    }

    pub fn processing_method(&self, endpoint: EndpointId) -> ProcessingMethod {
        self.queues
            .get(&endpoint)
            .map(|q| q.method)
            .unwrap_or_default()
    }

    /// Queue `command` for each endpoint. Endpoints in `ProcessAll` mode with
    /// nothing pending run it immediately, preserving per-endpoint order.
    pub fn queue_command(&mut self, ctx: &mut C, endpoints: &[EndpointId], command: SyncCommand<C>) {
        for &endpoint in endpoints {
            let queue = self.queues.entry(endpoint).or_default();
            if queue.method == ProcessingMethod::ProcessAll && queue.commands.is_empty() {
                command(ctx, endpoint);
            } else {
                queue.commands.push_back(command.clone());
            }
        }
    }

    /// Run queued commands.
    ///
    /// `ProcessAll` endpoints are drained. Time-sliced endpoints each get at
    /// least one command per call, then keep going round-robin until `budget`
    /// is spent. Returns the time-sliced endpoints whose queue drained; they
    /// are switched back to `ProcessAll`.
    pub fn process_queue(&mut self, ctx: &mut C, budget: Duration) -> Vec<EndpointId> {
        let start = Instant::now();

        for (&endpoint, queue) in self.queues.iter_mut() {
            if queue.method == ProcessingMethod::ProcessAll {
                while let Some(command) = queue.commands.pop_front() {
                    command(ctx, endpoint);
                }
            }
        }

        loop {
            let mut ran = false;
            for (&endpoint, queue) in self.queues.iter_mut() {
                if queue.method != ProcessingMethod::ProcessTimeSliced {
                    continue;
                }
                if let Some(command) = queue.commands.pop_front() {
                    command(ctx, endpoint);
                    ran = true;
                }
            }
            if !ran || start.elapsed() >= budget {
                break;
            }
        }

        let mut completed = Vec::new();
        for (&endpoint, queue) in self.queues.iter_mut() {
            if queue.method == ProcessingMethod::ProcessTimeSliced && queue.commands.is_empty() {
                queue.method = ProcessingMethod::ProcessAll;
                completed.push(endpoint);
            }
        }
        if !completed.is_empty() {
            log::trace!("Sync queue drained for {} endpoint(s)", completed.len());
        }
        completed
    }

    pub fn queued_commands(&self, endpoint: EndpointId) -> usize {
        self.queues.get(&endpoint).map_or(0, |q| q.commands.len())
    }

    /// Drop an endpoint's queue and pending commands.
    pub fn remove_endpoint(&mut self, endpoint: EndpointId) -> usize {
        self.queues
            .remove(&endpoint)
            .map_or(0, |q| q.commands.len())
    }
}
