// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use super::spec;
use std::time::Duration;
use thiserror::Error;
use user_driver::backoff::Backoff;
use user_driver::backoff::BudgetExhausted;
use user_driver::backoff::Sleep;
use user_driver::DeviceBacking;
use user_driver::DeviceRegisterIo;

pub(crate) struct DeviceRegisters<T: DeviceBacking> {
    pub bar0: Bar0<T::Registers>,
    pub cap: spec::Cap,
}

impl<T: DeviceBacking> DeviceRegisters<T> {
    pub fn new(bar0: Bar0<T::Registers>) -> Self {
        let cap = bar0.cap();
        Self { bar0, cap }
    }

    /// Returns the BAR0 offset of the tail (`completion == false`) or head
    /// doorbell of queue `qid`.
    pub fn doorbell_offset(&self, qid: u16, completion: bool) -> usize {
        let doorbell_stride_bits = self.cap.dstrd() + 2;
        spec::DOORBELL_BASE + ((qid as usize * 2 + completion as usize) << doorbell_stride_bits)
    }

    pub fn doorbell(&self, qid: u16, completion: bool, value: u32) {
        self.bar0
            .0
            .write_u32(self.doorbell_offset(qid, completion), value)
    }
}

/// A failed wait for CSTS.RDY to change.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("device is gone")]
    Gone,
    #[error("controller reported a fatal status")]
    Fatal,
    #[error("timed out waiting for CSTS.RDY to become {ready}")]
    Timeout {
        ready: bool,
        #[source]
        source: BudgetExhausted,
    },
}

pub(crate) struct Bar0<T>(pub T);

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u32(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u32(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

macro_rules! reg64 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u64(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u64(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

impl<T: DeviceRegisterIo> Bar0<T> {
    reg64!(cap, set_cap, CAP, spec::Cap);
    reg64!(asq, set_asq, ASQ, u64);
    reg64!(acq, set_acq, ACQ, u64);
    reg32!(cc, set_cc, CC, spec::Cc);
    reg32!(csts, set_csts, CSTS, spec::Csts);
    reg32!(aqa, set_aqa, AQA, spec::Aqa);

    /// Writes zero to CC and waits for CSTS.RDY to clear.
    pub fn reset(
        &self,
        sleep: &dyn Sleep,
        interval: Duration,
        budget: u32,
    ) -> Result<(), ReadyError> {
        self.set_cc(spec::Cc::new());
        self.wait_ready(false, &mut Backoff::new(sleep, interval, budget))
    }

    /// Polls CSTS until RDY equals `ready`.
    pub fn wait_ready(&self, ready: bool, backoff: &mut Backoff<'_>) -> Result<(), ReadyError> {
        loop {
            let csts = self.csts();
            if u32::from(csts) == !0 {
                break Err(ReadyError::Gone);
            }
            if ready && csts.cfs() {
                break Err(ReadyError::Fatal);
            }
            if csts.rdy() == ready {
                break Ok(());
            }
            backoff
                .back_off()
                .map_err(|source| ReadyError::Timeout { ready, source })?;
        }
    }
}
