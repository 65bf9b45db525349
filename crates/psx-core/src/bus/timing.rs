//! Programmable access timing.
//!
//! The memory controller exposes one delay/size register per external bus
//! device plus a shared COM_DELAY register. Both are decoded here with plain
//! shift-and-mask accessors over the raw 32-bit value; the packed layout is
//! part of the hardware interface, not of this implementation.

use crate::bus::TickCount;

/// A delay/size register (EXP1, EXP3, BIOS, SPU, CDROM, EXP2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDelay(pub u32);

impl MemDelay {
    /// Bits the bus preserves across writes.
    pub const WRITE_MASK: u32 = 0xAF1F_FFFF;

    pub fn access_time(self) -> u32 {
        (self.0 >> 4) & 0xF
    }

    pub fn use_com0_time(self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn use_com1_time(self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn use_com2_time(self) -> bool {
        self.0 & (1 << 10) != 0
    }

    pub fn use_com3_time(self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn data_bus_16bit(self) -> bool {
        self.0 & (1 << 12) != 0
    }

    pub fn memory_window_size(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    pub fn bus_width_bits(self) -> u32 {
        if self.data_bus_16bit() {
            16
        } else {
            8
        }
    }
}

/// The shared COM_DELAY register: four 4-bit cycle counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComDelay(pub u32);

impl ComDelay {
    pub const WRITE_MASK: u32 = 0x0003_FFFF;

    pub fn com0(self) -> u32 {
        self.0 & 0xF
    }

    pub fn com1(self) -> u32 {
        (self.0 >> 4) & 0xF
    }

    pub fn com2(self) -> u32 {
        (self.0 >> 8) & 0xF
    }

    pub fn com3(self) -> u32 {
        (self.0 >> 12) & 0xF
    }
}

/// Compute the (byte, halfword, word) tick counts for one device bus.
///
/// First-access and sequential-access times are built up from the COM
/// contributions, clamped against the COM3 minimum, then widened: an 8-bit
/// bus needs 2 accesses per halfword and 4 per word, a 16-bit bus half that.
/// The returned counts are stored form, `max(raw - 1, 0)`, so adding one to
/// a 0-based pending-tick counter lands on the raw cycle cost.
pub fn calculate_memory_timing(
    mem_delay: MemDelay,
    common_delay: ComDelay,
) -> (TickCount, TickCount, TickCount) {
    let mut first: i32 = 0;
    let mut seq: i32 = 0;
    let mut min: i32 = 0;

    if mem_delay.use_com0_time() {
        first += common_delay.com0() as i32 - 1;
        seq += common_delay.com0() as i32 - 1;
    }
    if mem_delay.use_com2_time() {
        first += common_delay.com2() as i32;
        seq += common_delay.com2() as i32;
    }
    if mem_delay.use_com3_time() {
        min = common_delay.com3() as i32;
    }
    if first < 6 {
        first += 1;
    }

    first += mem_delay.access_time() as i32 + 2;
    seq += mem_delay.access_time() as i32 + 2;

    if first < min + 6 {
        first = min + 6;
    }
    if seq < min + 2 {
        seq = min + 2;
    }

    let byte = first;
    let halfword = if mem_delay.data_bus_16bit() {
        first
    } else {
        first + seq
    };
    let word = if mem_delay.data_bus_16bit() {
        first + seq
    } else {
        first + seq + seq + seq
    };

    (
        (byte - 1).max(0),
        (halfword - 1).max(0),
        (word - 1).max(0),
    )
}
