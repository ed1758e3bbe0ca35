//! Deferred work on the main loop, and the bootstrap completion gate.
//!
//! Work items run one at a time on the main thread. An item never
//! reschedules itself behind the scheduler's back: it returns a
//! [`WorkOutcome`] and the scheduler re-arms it or drops it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Number of one-second ticks bootstrap waits for one-shot tasks.
pub const GATE_TICKS: u32 = 120;

/// Interval between completion checks.
pub const GATE_INTERVAL: Duration = Duration::from_millis(1000);

/// What a work item wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Finished, drop the item
    Done,
    /// Run again after the given delay
    RetryAfter(Duration),
}

type Job<C> = Box<dyn FnMut(&mut C) -> WorkOutcome>;

/// A deferred callback and the delay before its next run.
pub struct WorkItem<C> {
    name: &'static str,
    delay: Duration,
    job: Job<C>,
}

impl<C> WorkItem<C> {
    /// An item that runs as soon as the loop gets to it.
    pub fn new(name: &'static str, job: impl FnMut(&mut C) -> WorkOutcome + 'static) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            job: Box::new(job),
        }
    }

    /// Delay the first run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

struct Armed<C> {
    due: Instant,
    seq: u64,
    item: WorkItem<C>,
}

/// Single-threaded queue of work items ordered by due time.
///
/// Items due at the same instant run in the order they were armed.
pub struct Scheduler<C> {
    queue: Vec<Armed<C>>,
    seq: u64,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            seq: 0,
        }
    }

    /// Arm `item` to run after its delay.
    pub fn schedule(&mut self, item: WorkItem<C>) {
        let due = Instant::now() + item.delay;
        debug!(work = item.name, delay_ms = item.delay.as_millis() as u64, "Scheduling work");

        let seq = self.seq;
        self.seq += 1;

        let pos = self
            .queue
            .iter()
            .position(|armed| (armed.due, armed.seq) > (due, seq))
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, Armed { due, seq, item });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// When the earliest item is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|armed| armed.due)
    }

    /// Run every item due by now. Items re-armed here wait for a later call,
    /// even with a zero delay. Returns how many items ran.
    pub fn run_due(&mut self, ctx: &mut C) -> usize {
        let now = Instant::now();
        let ready = self.queue.iter().take_while(|armed| armed.due <= now).count();
        let due: Vec<Armed<C>> = self.queue.drain(..ready).collect();

        for Armed { mut item, .. } in due {
            match (item.job)(ctx) {
                WorkOutcome::Done => debug!(work = item.name, "Work done"),
                WorkOutcome::RetryAfter(delay) => {
                    item.delay = delay;
                    self.schedule(item);
                }
            }
        }

        ready
    }

    /// Keep running items until the queue is empty.
    pub async fn run_until_idle(&mut self, ctx: &mut C) {
        while let Some(deadline) = self.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            self.run_due(ctx);
        }
    }
}

/// Verdict of one completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Not done yet, check again later
    Wait { remaining: u32 },
    /// All one-shot bootstrap tasks finished on this tick
    Completed { tick: u32 },
    /// Gave up waiting on this tick
    TimedOut { tick: u32 },
    /// The gate already opened; nothing more to do
    Spent,
}

/// Bounded countdown deciding when bootstrap may finalize.
///
/// Opens on the first tick that sees completion, or on the last tick of the
/// budget regardless. It opens exactly once.
#[derive(Debug, Clone)]
pub struct CompletionGate {
    remaining: u32,
    ticks: u32,
    open: bool,
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new(GATE_TICKS)
    }
}

impl CompletionGate {
    pub fn new(ticks: u32) -> Self {
        Self {
            remaining: ticks,
            ticks: 0,
            open: false,
        }
    }

    /// Feed one observation of the completion predicate.
    pub fn tick(&mut self, completed: bool) -> GateVerdict {
        if self.open {
            return GateVerdict::Spent;
        }
        self.ticks += 1;

        if completed {
            self.open = true;
            return GateVerdict::Completed { tick: self.ticks };
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.open = true;
            return GateVerdict::TimedOut { tick: self.ticks };
        }

        GateVerdict::Wait {
            remaining: self.remaining,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}
