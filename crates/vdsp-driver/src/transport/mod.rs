// SPDX-License-Identifier: AGPL-3.0-only

//! Command transport: boot, handshake, queued submission and recovery.
//!
//! ## Submission
//!
//! ```text
//!   wait Operational(g) ─► claim queue ─► still g? ─► post ─► doorbell ─► wait
//!                                                                          │
//!        done ◄── response ◄──────────────────────────────────────────────┤
//!        retry ◄── another submitter is recovering ◄─────────────────────┤
//!        reboot ◄── timeout, this submitter leads recovery ◄─────────────┘
//! ```
//!
//! ## Recovery
//!
//! The first submitter to time out in generation `g` leads. It wakes every
//! waiter, claims every other queue, reboots the accelerator and moves the
//! link to `Operational(g + 1)`, or to `Down` if the reboot fails. Its own
//! request fails with the timeout; requests that were waiting in other queues
//! are posted again once the link is back. Libraries loaded before the reboot
//! are dropped by the library registry when it sees the new generation.
//!
//! Lock order: library registry → queue slot → buffer and IOMMU tables.

pub mod recovery;

mod queue;
mod sync;
pub(crate) mod wire;

pub use recovery::LinkState;
pub use wire::Descriptor;

use crate::config::{CompletionMode, LogConfig, VdspConfig};
use crate::dma::DmaRegion;
use crate::error::{Result, VdspError};
use crate::firmware::FirmwareLoader;
use crate::lock;
use crate::platform::Accelerator;
use bytes::Bytes;
use queue::Queue;
use recovery::Recovery;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vdsp_chip::comm::cmd::flags;
use vdsp_chip::library::nsid_name;
use wire::HwRequest;

/// Answer to a posted request.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    /// Inline output, empty when the output went to a buffer
    pub output: Bytes,
    /// Link generation the request completed in
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Settings {
    cmd_timeout: Duration,
    boot_timeout: Duration,
    reboot: bool,
    completion: CompletionMode,
    poll_yield_interval: u32,
    priorities: Vec<u32>,
    log: LogConfig,
}

enum Wait {
    Done,
    Aborted,
    TimedOut,
}

/// Queues negotiated in the last handshake, lowest priority first.
#[derive(Debug, Clone)]
struct Negotiated {
    order: Vec<usize>,
    priorities: Vec<u32>,
}

/// Shared command region plus the queues multiplexed over it.
#[derive(Debug)]
pub struct Transport {
    accel: Arc<dyn Accelerator>,
    comm: Arc<DmaRegion>,
    loader: FirmwareLoader,
    log_iova: u32,
    settings: Settings,
    queues: Vec<Queue>,
    negotiated: Mutex<Negotiated>,
    recovery: Recovery,
}

impl Transport {
    /// Transport over `comm`; call [`Self::start`] to boot.
    pub(crate) fn new(
        config: &VdspConfig,
        accel: Arc<dyn Accelerator>,
        comm: Arc<DmaRegion>,
        loader: FirmwareLoader,
        log_iova: u32,
    ) -> Self {
        let queues = (0..config.queue_priorities.len()).map(Queue::new).collect();
        Self {
            accel,
            comm,
            loader,
            log_iova,
            settings: Settings {
                cmd_timeout: config.cmd_timeout,
                boot_timeout: config.boot_timeout,
                reboot: config.firmware_reboot,
                completion: config.completion,
                poll_yield_interval: config.poll_yield_interval,
                priorities: config.queue_priorities.clone(),
                log: config.log,
            },
            queues,
            negotiated: Mutex::new(Negotiated {
                order: vec![0],
                priorities: vec![0],
            }),
            recovery: Recovery::new(),
        }
    }

    /// Boot the accelerator and open the link.
    ///
    /// # Errors
    ///
    /// Returns the boot error; the accelerator is left halted and the link
    /// `Down`.
    pub(crate) fn start(&self) -> Result<()> {
        match self.boot() {
            Ok(()) => {
                self.recovery.set(LinkState::Operational);
                Ok(())
            }
            Err(e) => {
                self.recovery.set(LinkState::Down);
                Err(e)
            }
        }
    }

    /// Halt the accelerator and close the link. Waiters fail with
    /// [`VdspError::DeviceUnavailable`].
    pub(crate) fn stop(&self) {
        self.recovery.set(LinkState::Offline);
        for q in &self.queues {
            q.kick();
        }
        self.accel.halt();
    }

    /// Link state and generation.
    pub fn link(&self) -> (LinkState, u64) {
        self.recovery.snapshot()
    }

    /// Queues in use after the handshake.
    pub fn active_queues(&self) -> usize {
        lock(&self.negotiated).order.len()
    }

    /// Priorities the accelerator reported, by queue index.
    pub fn queue_priorities(&self) -> Vec<u32> {
        lock(&self.negotiated).priorities.clone()
    }

    /// Host interrupt: wake the waiter of every answered queue.
    pub(crate) fn handle_irq(&self) {
        for q in &self.queues {
            if wire::is_complete(&self.comm, q.offset) {
                q.signal();
            }
        }
    }

    /// Halt, reset, load, release and handshake.
    fn boot(&self) -> Result<()> {
        self.accel.halt();
        self.accel.reset();
        let result = self.loader.load().and_then(|info| {
            // Every slot idle, sync word included.
            self.comm.fill(0, self.comm.len(), 0);
            self.accel.release(&info)?;
            self.synchronize()
        });
        if let Err(e) = &result {
            error!("accelerator boot failed: {e}");
            self.accel.halt();
        }
        result
    }

    fn pick_queue(&self, priority: u32) -> &Queue {
        let negotiated = lock(&self.negotiated);
        let n = negotiated.order.len();
        let rank = (priority as usize).min(n - 1);
        &self.queues[negotiated.order[rank]]
    }

    /// Post `req`, wait for the answer and collect it. Survives a recovery
    /// started by another submitter by posting again.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::Timeout`] if this request timed out,
    /// [`VdspError::DeviceUnavailable`] once the link is down, and
    /// [`VdspError::UnknownNamespace`] if the accelerator could not route it.
    pub(crate) fn submit(&self, req: &HwRequest) -> Result<Completion> {
        loop {
            let generation = self.recovery.wait_operational()?;
            let queue = self.pick_queue(req.priority);
            let slot = queue.claim();
            if !self.recovery.is_current(generation) {
                continue;
            }

            wire::post(&self.comm, queue.offset, req);
            self.accel.send_irq();

            match self.wait_response(queue) {
                Wait::Done => {
                    let (status, output) = wire::take_response(&self.comm, queue.offset, req);
                    drop(slot);
                    if status & flags::RESPONSE_DELIVERY_FAIL != 0 {
                        let nsid = req.nsid.as_ref().map_or("", |n| nsid_name(n)).to_owned();
                        return Err(VdspError::UnknownNamespace { nsid });
                    }
                    return Ok(Completion { output, generation });
                }
                Wait::Aborted => {
                    drop(slot);
                    debug!("queue {}: request interrupted by recovery", queue.index);
                    self.recovery.wait_past(generation)?;
                }
                Wait::TimedOut => {
                    let timeout = VdspError::timeout(self.settings.cmd_timeout);
                    if !self.settings.reboot {
                        error!("queue {}: request timed out, reboot disabled", queue.index);
                        return Err(timeout);
                    }
                    if self.recovery.try_lead(generation) {
                        self.recover(queue, generation)?;
                        return Err(timeout);
                    }
                    drop(slot);
                    self.recovery.wait_past(generation)?;
                }
            }
        }
    }

    fn wait_response(&self, queue: &Queue) -> Wait {
        let deadline = Instant::now() + self.settings.cmd_timeout;
        let mut outcome = Wait::TimedOut;
        let mut check = || {
            if wire::is_complete(&self.comm, queue.offset) {
                outcome = Wait::Done;
                return true;
            }
            if self.recovery.is_recovering() {
                outcome = Wait::Aborted;
                return true;
            }
            if self.accel.panic_check() {
                error!("accelerator panic reported while waiting on queue {}", queue.index);
                return true;
            }
            false
        };
        match self.settings.completion {
            CompletionMode::Irq => {
                queue.wait_until(deadline, |_| check());
            }
            CompletionMode::Polling => {
                poll_until(deadline, self.settings.poll_yield_interval, check);
            }
        }
        outcome
    }

    /// Reboot as leader of `generation`. Called with `own` claimed.
    fn recover(&self, own: &Queue, generation: u64) -> Result<()> {
        warn!(
            "queue {}: request timed out, rebooting accelerator (generation {generation})",
            own.index
        );
        for q in &self.queues {
            q.kick();
        }
        let _others: Vec<_> = self
            .queues
            .iter()
            .filter(|q| q.index != own.index)
            .map(Queue::claim)
            .collect();

        self.accel.coredump();
        let result = self.boot();
        let next = self.recovery.finish(result.is_ok());
        match &result {
            Ok(()) => info!("accelerator recovered, generation {next}"),
            Err(e) => error!("accelerator recovery failed, link down: {e}"),
        }
        result
    }
}

/// Poll `done` until it holds or `deadline` passes, yielding every
/// `yield_interval` polls.
pub(crate) fn poll_until(deadline: Instant, yield_interval: u32, mut done: impl FnMut() -> bool) -> bool {
    let mut polls = 0u32;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        polls = polls.wrapping_add(1);
        if polls % yield_interval == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}
