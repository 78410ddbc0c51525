// SPDX-License-Identifier: AGPL-3.0-only

//! Boot handshake.
//!
//! ```text
//!   host                         accelerator
//!   sync = START        ─►
//!                       ◄─  sync = DSP_READY_V1 | DSP_READY_V2
//!   hw blob / TLVs,
//!   sync = HOST_TO_DSP  ─►
//!                       ◄─  sync = DSP_TO_HOST (TLVs marked ACCEPT)
//!   doorbell            ─►
//!                       ◄─  host interrupt (IRQ mode)
//!   sync = IDLE
//! ```
//!
//! A v1 accelerator takes the hardware blob only and serves one queue. A v2
//! accelerator takes TLV records: the hardware blob, the queue priority table
//! when more than one queue is configured, and the log settings.

// Record lengths are bounded by the 224-byte TLV area
#![allow(clippy::cast_possible_truncation)]

use super::{poll_until, Negotiated, Transport};
use crate::config::CompletionMode;
use crate::error::{Result, VdspError};
use crate::lock;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use vdsp_chip::comm::{sync, tlv};

impl Transport {
    /// Run the handshake. The sync word is back to IDLE afterwards whatever
    /// the outcome.
    pub(super) fn synchronize(&self) -> Result<()> {
        let result = self.handshake();
        self.comm.write32(sync::OFFSET, sync::IDLE);
        match &result {
            Ok(n) => info!("accelerator synchronized, {n} queue(s)"),
            Err(e) => error!("accelerator handshake failed: {e}"),
        }
        result.map(|_| ())
    }

    fn handshake(&self) -> Result<usize> {
        let deadline = Instant::now() + self.settings.boot_timeout;
        let hw = self.accel.hw_sync_data(self.log_iova);
        let mut queues = self.settings.priorities.len();

        self.comm.write32(sync::OFFSET, sync::START);
        let mut reply = sync::START;
        let mut panicked = false;
        poll_until(deadline, self.settings.poll_yield_interval, || {
            reply = self.comm.read32(sync::OFFSET);
            panicked = self.accel.panic_check() || reply == sync::DSP_PANIC;
            reply != sync::START || panicked
        });
        if panicked {
            return Err(VdspError::protocol("accelerator panicked during handshake"));
        }

        let v2 = match reply {
            sync::DSP_READY_V1 => {
                if queues > 1 {
                    warn!("v1 accelerator, {queues} queues requested, using 1");
                    queues = 1;
                }
                self.comm.write(sync::OFFSET + sync::V1_DATA_OFFSET, &hw);
                false
            }
            sync::DSP_READY_V2 => {
                self.write_records(&hw, queues)?;
                true
            }
            sync::START => return Err(VdspError::protocol("accelerator did not answer START")),
            other => {
                return Err(VdspError::protocol(format!(
                    "unrecognized handshake reply {other:#x}"
                )))
            }
        };

        self.comm.write32(sync::OFFSET, sync::HOST_TO_DSP);
        let confirmed = poll_until(deadline, self.settings.poll_yield_interval, || {
            let word = self.comm.read32(sync::OFFSET);
            panicked = self.accel.panic_check() || word == sync::DSP_PANIC;
            word == sync::DSP_TO_HOST || panicked
        });
        if panicked {
            return Err(VdspError::protocol("accelerator panicked during handshake"));
        }
        if !confirmed {
            return Err(VdspError::protocol("accelerator did not confirm the handshake"));
        }

        let priorities = if v2 {
            self.complete_records(hw.len(), &mut queues)?
        } else {
            vec![self.settings.priorities[0]]
        };

        // The doorbell round trip proves interrupts work both ways.
        let queue0 = &self.queues[0];
        let seen = queue0.irq_count();
        self.accel.send_irq();
        if self.settings.completion == CompletionMode::Irq
            && !queue0.wait_until(deadline, |irqs| irqs > seen)
        {
            return Err(VdspError::protocol("no interrupt from the accelerator"));
        }

        let mut order: Vec<usize> = (0..queues).collect();
        order.sort_by_key(|&i| (priorities[i], i));
        debug!("queue order by priority: {order:?}");
        *lock(&self.negotiated) = Negotiated { order, priorities };
        Ok(queues)
    }

    fn write_records(&self, hw: &[u8], queues: usize) -> Result<()> {
        let mut records: Vec<(u32, Vec<u8>)> = vec![(tlv::HW_SPEC_DATA, hw.to_vec())];
        if queues > 1 {
            let table = self
                .settings
                .priorities
                .iter()
                .flat_map(|p| p.to_le_bytes())
                .collect();
            records.push((tlv::HW_QUEUES, table));
            for q in &self.queues[1..] {
                self.comm.write32(q.offset, sync::IDLE);
            }
        }
        let log = self.settings.log;
        let log_record = [log.mode, log.level]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        records.push((tlv::LOG, log_record));

        let total: usize = records
            .iter()
            .map(|(_, data)| tlv::record_size(data.len()))
            .sum::<usize>()
            + tlv::HEADER_SIZE;
        if total > tlv::CAPACITY {
            return Err(VdspError::protocol(format!(
                "handshake records need {total} bytes, only {} available",
                tlv::CAPACITY
            )));
        }

        let mut at = sync::V2_DATA_OFFSET;
        for (kind, data) in &records {
            self.comm.write32(at, *kind);
            self.comm.write32(at + 4, data.len() as u32);
            let mut padded = data.clone();
            padded.resize(tlv::padded(data.len()), 0);
            self.comm.write(at + tlv::HEADER_SIZE, &padded);
            at += tlv::record_size(data.len());
        }
        self.comm.write32(at, tlv::LAST);
        self.comm.write32(at + 4, 0);
        Ok(())
    }

    /// Read back the records the accelerator acknowledged. Returns the queue
    /// priorities and narrows `queues` to 1 if the table was refused.
    fn complete_records(&self, hw_len: usize, queues: &mut usize) -> Result<Vec<u32>> {
        let mut at = sync::V2_DATA_OFFSET;
        let kind = self.comm.read32(at);
        let len = self.comm.read32(at + 4) as usize;
        if len != hw_len {
            return Err(VdspError::protocol(format!(
                "hardware record length changed from {hw_len} to {len}"
            )));
        }
        if kind & tlv::ACCEPT == 0 {
            error!("accelerator did not accept the hardware record");
        }
        at += tlv::record_size(len);

        if *queues == 1 {
            return Ok(vec![self.settings.priorities[0]]);
        }
        let kind = self.comm.read32(at);
        let len = self.comm.read32(at + 4) as usize;
        if len != *queues * 4 {
            return Err(VdspError::protocol(format!(
                "queue record length changed from {} to {len}",
                *queues * 4
            )));
        }
        if kind & tlv::ACCEPT == 0 {
            warn!("accelerator refused {} queues, using 1", *queues);
            *queues = 1;
            return Ok(vec![self.settings.priorities[0]]);
        }
        Ok((0..*queues)
            .map(|i| self.comm.read32(at + tlv::HEADER_SIZE + i * 4))
            .collect())
    }
}
