// SPDX-License-Identifier: AGPL-3.0-only

//! Link state machine.
//!
//! ```text
//!   Offline ──boot──► Operational(g) ──timeout──► Recovering(g)
//!      ▲                    ▲                        │
//!      │                    └──── reboot ok ─────────┤ (g + 1)
//!      └──── close ──── Down ◄──── reboot failed ────┘
//! ```
//!
//! The generation counts completed recoveries. A submitter that saw
//! generation `g` only posts while the link is still `Operational(g)`.

use crate::error::{Result, VdspError};
use crate::lock;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

/// Transport link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not booted
    Offline,
    /// Accepting requests
    Operational,
    /// A reboot is in progress
    Recovering,
    /// Boot or recovery failed; the accelerator is halted
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Operational => write!(f, "operational"),
            Self::Recovering => write!(f, "recovering"),
            Self::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct State {
    link: LinkState,
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct Recovery {
    state: Mutex<State>,
    changed: Condvar,
}

impl Recovery {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                link: LinkState::Offline,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> (LinkState, u64) {
        let s = lock(&self.state);
        (s.link, s.generation)
    }

    pub fn is_recovering(&self) -> bool {
        lock(&self.state).link == LinkState::Recovering
    }

    /// Whether the link is still `Operational(generation)`.
    pub fn is_current(&self, generation: u64) -> bool {
        let s = lock(&self.state);
        s.link == LinkState::Operational && s.generation == generation
    }

    /// Block through a recovery and return the operational generation.
    pub fn wait_operational(&self) -> Result<u64> {
        let mut s = lock(&self.state);
        loop {
            match s.link {
                LinkState::Operational => return Ok(s.generation),
                LinkState::Recovering => {
                    s = self
                        .changed
                        .wait(s)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                LinkState::Offline | LinkState::Down => return Err(VdspError::DeviceUnavailable),
            }
        }
    }

    /// Block until the link has moved past `generation`.
    pub fn wait_past(&self, generation: u64) -> Result<()> {
        let mut s = lock(&self.state);
        loop {
            match s.link {
                LinkState::Operational if s.generation > generation => return Ok(()),
                LinkState::Offline | LinkState::Down => return Err(VdspError::DeviceUnavailable),
                _ => {
                    s = self
                        .changed
                        .wait(s)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Claim recovery of `generation`. Only one caller per generation wins.
    pub fn try_lead(&self, generation: u64) -> bool {
        let mut s = lock(&self.state);
        if s.link == LinkState::Operational && s.generation == generation {
            s.link = LinkState::Recovering;
            true
        } else {
            false
        }
    }

    /// End a recovery: the next generation on success, `Down` otherwise.
    pub fn finish(&self, rebooted: bool) -> u64 {
        let mut s = lock(&self.state);
        if rebooted {
            s.generation += 1;
            s.link = LinkState::Operational;
        } else {
            s.link = LinkState::Down;
        }
        self.changed.notify_all();
        s.generation
    }

    pub fn set(&self, link: LinkState) {
        let mut s = lock(&self.state);
        s.link = link;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_leader_per_generation() {
        let r = Recovery::new();
        assert!(matches!(r.wait_operational(), Err(VdspError::DeviceUnavailable)));
        r.set(LinkState::Operational);
        assert_eq!(r.wait_operational().unwrap(), 0);
        assert!(r.try_lead(0));
        assert!(!r.try_lead(0));
        assert!(r.is_recovering());
        assert_eq!(r.finish(true), 1);
        assert!(r.is_current(1));
        assert!(!r.try_lead(0));
    }

    #[test]
    fn test_waiters_released_by_recovery() {
        let r = Arc::new(Recovery::new());
        r.set(LinkState::Operational);
        assert!(r.try_lead(0));
        let r2 = Arc::clone(&r);
        let waiter = std::thread::spawn(move || r2.wait_past(0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        r.finish(false);
        assert!(matches!(waiter.join().unwrap(), Err(VdspError::DeviceUnavailable)));
        assert_eq!(r.snapshot().0, LinkState::Down);
    }
}
