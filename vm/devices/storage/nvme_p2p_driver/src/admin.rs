// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller bring-up and the admin queue.

use super::spec;
use crate::driver::DeviceError;
use crate::driver::NvmeDriverConfig;
use crate::queue_pair::QueuePair;
use crate::queue_pair::RequestError;
use crate::registers::DeviceRegisters;
use crate::registers::ReadyError;
use std::sync::Arc;
use user_driver::backoff::Backoff;
use user_driver::backoff::Sleep;
use user_driver::DeviceBacking;

pub(crate) const ADMIN_QID: u16 = 0;

/// log2 of the submission queue entry size.
const IOSQES: u8 = 6;
/// log2 of the completion queue entry size.
const IOCQES: u8 = 4;

pub(crate) struct AdminQueue<T: DeviceBacking> {
    queue: QueuePair<T>,
    registers: Arc<DeviceRegisters<T>>,
    sleep: Arc<dyn Sleep>,
    config: NvmeDriverConfig,
}

impl<T: DeviceBacking> AdminQueue<T> {
    /// Resets the controller, programs a freshly allocated admin queue pair
    /// of `len` entries, and enables the controller.
    pub fn enable(
        registers: &Arc<DeviceRegisters<T>>,
        allocator: &T::DmaAllocator,
        sleep: &Arc<dyn Sleep>,
        len: u16,
        config: &NvmeDriverConfig,
    ) -> Result<Self, DeviceError> {
        let bar0 = &registers.bar0;
        let timeout = registers.cap.to().into();

        bar0.reset(&**sleep, config.ready_poll_interval, timeout)
            .map_err(DeviceError::Disable)?;

        let queue = QueuePair::new(
            allocator,
            ADMIN_QID,
            len,
            registers.clone(),
            sleep.clone(),
            config.command_poll_interval,
        )
        .map_err(|err| DeviceError::Allocation("admin queues", err))?;

        bar0.set_aqa(
            spec::Aqa::new()
                .with_asqs_z(len - 1)
                .with_acqs_z(len - 1),
        );
        bar0.set_asq(queue.sq_addr());
        bar0.set_acq(queue.cq_addr());
        bar0.set_cc(
            spec::Cc::new()
                .with_iosqes(IOSQES)
                .with_iocqes(IOCQES)
                .with_en(true),
        );

        let mut backoff = Backoff::new(&**sleep, config.ready_poll_interval, timeout);
        if let Err(err) = bar0.wait_ready(true, &mut backoff) {
            if !matches!(err, ReadyError::Gone) {
                bar0.set_cc(spec::Cc::new());
            }
            return Err(DeviceError::Enable(err));
        }

        tracing::info!(
            len,
            sq = queue.sq_addr(),
            cq = queue.cq_addr(),
            "controller enabled"
        );

        Ok(Self {
            queue,
            registers: registers.clone(),
            sleep: sleep.clone(),
            config: config.clone(),
        })
    }

    /// Issues an admin command, waiting up to the controller's timeout.
    pub fn issue(&mut self, command: spec::Command) -> Result<spec::Completion, RequestError> {
        let timeout = self.registers.cap.to().into();
        self.queue.issue(command, timeout)
    }

    /// Disables the controller. The admin rings are freed when `self` drops,
    /// whether or not the controller acknowledged.
    pub fn disable(&self) {
        let timeout = self.registers.cap.to().into();
        if let Err(err) =
            self.registers
                .bar0
                .reset(&*self.sleep, self.config.ready_poll_interval, timeout)
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "controller did not acknowledge disable"
            );
        }
    }
}
