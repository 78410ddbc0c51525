// SPDX-License-Identifier: AGPL-3.0-only

//! DVFS level selection.
//!
//! The effective level is the highest of the base level and every session's
//! power hint, capped at the platform maximum. The base level is fixed, or in
//! auto mode follows activity: maximum while any request is in flight, zero
//! when idle.

use crate::device::SessionId;
use crate::error::{Result, VdspError};
use crate::lock;
use crate::platform::Accelerator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// How the base level is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvfsMode {
    /// Always this level
    Fixed(u32),
    /// Maximum while busy, zero when idle
    Auto,
}

#[derive(Debug)]
struct State {
    mode: DvfsMode,
    hints: HashMap<SessionId, u32>,
    busy: u32,
    enabled: bool,
    level: Option<u32>,
}

/// DVFS governor for one accelerator.
#[derive(Debug)]
pub struct Dvfs {
    accel: Arc<dyn Accelerator>,
    max_level: u32,
    state: Mutex<State>,
}

impl Dvfs {
    /// Governor in auto mode, not yet enabled.
    pub fn new(accel: Arc<dyn Accelerator>, max_level: u32) -> Self {
        Self {
            accel,
            max_level,
            state: Mutex::new(State {
                mode: DvfsMode::Auto,
                hints: HashMap::new(),
                busy: 0,
                enabled: false,
                level: None,
            }),
        }
    }

    fn target(&self, s: &State) -> u32 {
        let base = match s.mode {
            DvfsMode::Fixed(level) => level,
            DvfsMode::Auto if s.busy > 0 => self.max_level,
            DvfsMode::Auto => 0,
        };
        s.hints
            .values()
            .copied()
            .fold(base, u32::max)
            .min(self.max_level)
    }

    fn apply(&self, s: &mut State) -> Result<()> {
        if !s.enabled {
            return Ok(());
        }
        let target = self.target(s);
        if s.level != Some(target) {
            self.accel.set_dvfs_level(target)?;
            debug!("DVFS level {target}");
            s.level = Some(target);
        }
        Ok(())
    }

    fn check(&self, level: u32) -> Result<()> {
        if level > self.max_level {
            return Err(VdspError::invalid_argument(format!(
                "DVFS level {level} above maximum {}",
                self.max_level
            )));
        }
        Ok(())
    }

    /// Start programming levels, after power on.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the level cannot be applied.
    pub fn enable(&self) -> Result<()> {
        let mut s = lock(&self.state);
        s.enabled = true;
        s.level = None;
        self.apply(&mut s)
    }

    /// Stop programming levels, before power off.
    pub fn disable(&self) {
        let mut s = lock(&self.state);
        s.enabled = false;
        s.busy = 0;
        s.level = None;
    }

    /// Select the base level.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for a level above the maximum.
    pub fn set_mode(&self, mode: DvfsMode) -> Result<()> {
        if let DvfsMode::Fixed(level) = mode {
            self.check(level)?;
        }
        let mut s = lock(&self.state);
        s.mode = mode;
        self.apply(&mut s)
    }

    /// Set or clear a session's power hint.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for a level above the maximum.
    pub fn set_hint(&self, session: SessionId, level: u32, enable: bool) -> Result<()> {
        self.check(level)?;
        let mut s = lock(&self.state);
        if enable {
            s.hints.insert(session, level);
        } else {
            s.hints.remove(&session);
        }
        self.apply(&mut s)
    }

    /// Forget a closing session's hint.
    pub fn release(&self, session: SessionId) {
        let mut s = lock(&self.state);
        if s.hints.remove(&session).is_some() {
            if let Err(e) = self.apply(&mut s) {
                warn!("DVFS update after {session} closed: {e}");
            }
        }
    }

    /// A request went out.
    pub fn begin(&self) {
        let mut s = lock(&self.state);
        s.busy += 1;
        if let Err(e) = self.apply(&mut s) {
            warn!("DVFS raise: {e}");
        }
    }

    /// A request finished.
    pub fn end(&self) {
        let mut s = lock(&self.state);
        s.busy = s.busy.saturating_sub(1);
        if let Err(e) = self.apply(&mut s) {
            warn!("DVFS lower: {e}");
        }
    }

    /// Level last programmed.
    pub fn level(&self) -> Option<u32> {
        lock(&self.state).level
    }

    /// Current mode.
    pub fn mode(&self) -> DvfsMode {
        lock(&self.state).mode
    }
}
