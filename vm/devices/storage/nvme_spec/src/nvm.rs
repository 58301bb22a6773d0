// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVM command set definitions
//!
//! NVM Command Set 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-NVM-Command-Set-Specification-1.0c-2022.10.03-Ratified.pdf>

use bitfield_struct::bitfield;
use open_enum::open_enum;

/// The logical block size assumed by the read/write path.
pub const BLOCK_SIZE: usize = 512;

#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NvmOpcode {
    WRITE = 0x01,
    READ = 0x02,
}

#[bitfield(u32)]
pub struct Cdw10ReadWrite {
    /// Starting LBA, low 32 bits.
    pub sbla_low: u32,
}

#[bitfield(u32)]
pub struct Cdw11ReadWrite {
    /// Starting LBA, high 32 bits.
    pub sbla_high: u32,
}

#[bitfield(u32)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks. Zero-based.
    pub nlb_z: u16,
    #[bits(4)]
    _rsvd: u8,
    /// Directive type (write only).
    #[bits(4)]
    pub dtype: u8,
    /// Storage tag check.
    pub stc: bool,
    _rsvd2: bool,
    /// Protection information
    #[bits(4)]
    pub prinfo: u8,
    /// Force unit access
    pub fua: bool,
    /// Limited retry
    pub lr: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_dwords() {
        let slba: u64 = 0x1_2345_6789;
        let cdw10: u32 = Cdw10ReadWrite::new().with_sbla_low(slba as u32).into();
        let cdw11: u32 = Cdw11ReadWrite::new()
            .with_sbla_high((slba >> 32) as u32)
            .into();
        assert_eq!(cdw10, 0x2345_6789);
        assert_eq!(cdw11, 1);

        let cdw12: u32 = Cdw12ReadWrite::new().with_nlb_z(2047).with_fua(true).into();
        assert_eq!(cdw12, 2047 | (1 << 30));
    }
}
