pub mod cop0;
pub mod exceptions;

use crate::bus::{AccessWidth, Bus, MemoryValue, TickCount};
use self::cop0::Cop0;
use self::exceptions::Exception;

/// Physical location of the scratchpad (the d-cache mapped as fast RAM).
pub const DCACHE_LOCATION: u32 = 0x1F80_0000;
pub const DCACHE_LOCATION_MASK: u32 = 0x1FFF_FC00;
pub const DCACHE_OFFSET_MASK: u32 = 0x3FF;
pub const DCACHE_SIZE: usize = 0x400;

pub const RESET_VECTOR: u32 = 0xBFC0_0000;

/// Address of the cache control register, the only thing mapped in KSEG2.
const CACHE_CONTROL_ADDRESS: u32 = 0xFFFE_0130;

/// R3000A memory-side state: the segment mapper between virtual addresses
/// and the physical bus, plus the registers it needs to do that job.
///
/// The R3000A has no MMU — the top three address bits pick a fixed segment.
/// Execution (decode, ALU, exception vectoring) lives elsewhere; this module
/// owns every load, store, and instruction fetch.
pub struct Cpu {
    /// Program counter of the instruction currently executing.
    pub pc: u32,

    /// Next PC — where the next fetch happens. Always word-aligned.
    pub npc: u32,

    /// Instruction word latched by the last successful fetch.
    pub next_instruction: u32,

    /// PC recorded by recompiler thunks before they touch memory, so a
    /// fault mid-block attributes to the right instruction.
    pub current_instruction_pc: u32,

    /// Device cycles owed to the scheduler. Reads add their region cost
    /// here; writes are free (the write buffer soaks them up).
    pub pending_ticks: TickCount,

    pub cop0: Cop0,

    /// The KSEG2 cache control word (0xFFFE0130).
    pub cache_control: u32,

    /// 1 KiB d-cache backing store, visible as the scratchpad.
    pub dcache: [u8; DCACHE_SIZE],
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            pc: RESET_VECTOR,
            npc: RESET_VECTOR.wrapping_add(4),
            next_instruction: 0,
            current_instruction_pc: 0,
            pending_ticks: 0,
            cop0: Cop0::new(),
            cache_control: 0,
            dcache: [0; DCACHE_SIZE],
        }
    }

    pub fn reset(&mut self) {
        self.pc = RESET_VECTOR;
        self.npc = RESET_VECTOR.wrapping_add(4);
        self.next_instruction = 0;
        self.current_instruction_pc = 0;
        self.pending_ticks = 0;
        self.cop0.reset();
        self.cache_control = 0;
        self.dcache = [0; DCACHE_SIZE];
    }

    /// Record an exception against the instruction currently executing.
    /// Vectoring to the handler is the execution core's job.
    pub fn raise_exception(&mut self, code: Exception) {
        self.raise_exception_at(code, self.current_instruction_pc);
    }

    pub fn raise_exception_at(&mut self, code: Exception, epc: u32) {
        self.cop0.record_exception(code, epc);
    }

    // ─── Instruction fetch ───────────────────────────────────────

    /// Fetch the word at `npc` into `next_instruction` and advance.
    /// Callers keep `npc` word-aligned, so no alignment check here. A bus
    /// error raises IBE (which does not set BadVaddr) and leaves the PCs
    /// where they were.
    pub fn fetch_instruction(&mut self, bus: &mut Bus) -> bool {
        debug_assert!(self.npc & 3 == 0);
        let (ticks, value) = self.do_memory_read::<u32>(bus, self.npc);
        if ticks < 0 {
            self.raise_exception_at(Exception::BusErrorInstruction, self.npc);
            return false;
        }

        self.next_instruction = value;
        self.pc = self.npc;
        self.npc = self.npc.wrapping_add(4);
        true
    }

    // ─── Trapping loads and stores ───────────────────────────────

    pub fn read_memory_byte(&mut self, bus: &mut Bus, address: u32) -> Option<u8> {
        let (ticks, value) = self.do_memory_read::<u8>(bus, address);
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return None;
        }

        self.pending_ticks += ticks;
        Some(value as u8)
    }

    pub fn read_memory_half_word(&mut self, bus: &mut Bus, address: u32) -> Option<u16> {
        if !self.check_alignment::<u16>(address, false) {
            return None;
        }

        let (ticks, value) = self.do_memory_read::<u16>(bus, address);
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return None;
        }

        self.pending_ticks += ticks;
        Some(value as u16)
    }

    pub fn read_memory_word(&mut self, bus: &mut Bus, address: u32) -> Option<u32> {
        if !self.check_alignment::<u32>(address, false) {
            return None;
        }

        let (ticks, value) = self.do_memory_read::<u32>(bus, address);
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return None;
        }

        self.pending_ticks += ticks;
        Some(value)
    }

    pub fn write_memory_byte(&mut self, bus: &mut Bus, address: u32, value: u8) -> bool {
        let ticks = self.do_memory_write::<u8>(bus, address, u32::from(value));
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return false;
        }
        true
    }

    pub fn write_memory_half_word(&mut self, bus: &mut Bus, address: u32, value: u16) -> bool {
        if !self.check_alignment::<u16>(address, true) {
            return false;
        }

        let ticks = self.do_memory_write::<u16>(bus, address, u32::from(value));
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return false;
        }
        true
    }

    pub fn write_memory_word(&mut self, bus: &mut Bus, address: u32, value: u32) -> bool {
        if !self.check_alignment::<u32>(address, true) {
            return false;
        }

        let ticks = self.do_memory_write::<u32>(bus, address, value);
        if ticks < 0 {
            self.raise_exception(Exception::BusErrorData);
            return false;
        }
        true
    }

    // ─── Safe probes ─────────────────────────────────────────────
    //
    // Debugger and savestate tooling entry points: same routing as the
    // trapping surface, but no exceptions and no tick billing.

    pub fn safe_read_memory_byte(&mut self, bus: &mut Bus, address: u32) -> Option<u8> {
        let (ticks, value) = self.do_memory_read::<u8>(bus, address);
        (ticks >= 0).then_some(value as u8)
    }

    pub fn safe_read_memory_half_word(&mut self, bus: &mut Bus, address: u32) -> Option<u16> {
        let (ticks, value) = self.do_memory_read::<u16>(bus, address);
        (ticks >= 0).then_some(value as u16)
    }

    pub fn safe_read_memory_word(&mut self, bus: &mut Bus, address: u32) -> Option<u32> {
        let (ticks, value) = self.do_memory_read::<u32>(bus, address);
        (ticks >= 0).then_some(value)
    }

    pub fn safe_write_memory_byte(&mut self, bus: &mut Bus, address: u32, value: u8) -> bool {
        self.do_memory_write::<u8>(bus, address, u32::from(value)) >= 0
    }

    pub fn safe_write_memory_half_word(&mut self, bus: &mut Bus, address: u32, value: u16) -> bool {
        self.do_memory_write::<u16>(bus, address, u32::from(value)) >= 0
    }

    pub fn safe_write_memory_word(&mut self, bus: &mut Bus, address: u32, value: u32) -> bool {
        self.do_memory_write::<u32>(bus, address, value) >= 0
    }

    // ─── Recompiler thunks ───────────────────────────────────────
    //
    // Same contracts as the trapping surface, but compiled blocks pass the
    // PC of the faulting instruction explicitly; it is latched before the
    // access so exception state attributes correctly.

    pub fn recompiler_read_memory_byte(&mut self, bus: &mut Bus, pc: u32, address: u32) -> Option<u8> {
        self.current_instruction_pc = pc;
        self.read_memory_byte(bus, address)
    }

    pub fn recompiler_read_memory_half_word(
        &mut self,
        bus: &mut Bus,
        pc: u32,
        address: u32,
    ) -> Option<u16> {
        self.current_instruction_pc = pc;
        self.read_memory_half_word(bus, address)
    }

    pub fn recompiler_read_memory_word(&mut self, bus: &mut Bus, pc: u32, address: u32) -> Option<u32> {
        self.current_instruction_pc = pc;
        self.read_memory_word(bus, address)
    }

    pub fn recompiler_write_memory_byte(
        &mut self,
        bus: &mut Bus,
        pc: u32,
        address: u32,
        value: u8,
    ) -> bool {
        self.current_instruction_pc = pc;
        self.write_memory_byte(bus, address, value)
    }

    pub fn recompiler_write_memory_half_word(
        &mut self,
        bus: &mut Bus,
        pc: u32,
        address: u32,
        value: u16,
    ) -> bool {
        self.current_instruction_pc = pc;
        self.write_memory_half_word(bus, address, value)
    }

    pub fn recompiler_write_memory_word(
        &mut self,
        bus: &mut Bus,
        pc: u32,
        address: u32,
        value: u32,
    ) -> bool {
        self.current_instruction_pc = pc;
        self.write_memory_word(bus, address, value)
    }

    // ─── Segment mapping ─────────────────────────────────────────

    fn check_alignment<V: MemoryValue>(&mut self, address: u32, write: bool) -> bool {
        let mask = V::WIDTH.byte_size() - 1;
        if address & mask == 0 {
            return true;
        }

        self.cop0.bad_vaddr = address;
        self.raise_exception(if write {
            Exception::AddressErrorStore
        } else {
            Exception::AddressErrorLoad
        });
        false
    }

    #[inline(always)]
    fn scratchpad_hit(physical_address: u32) -> bool {
        physical_address & DCACHE_LOCATION_MASK == DCACHE_LOCATION
    }

    fn read_scratchpad<V: MemoryValue>(&self, physical_address: u32) -> u32 {
        let offset =
            ((physical_address & DCACHE_OFFSET_MASK) & !(V::WIDTH.byte_size() - 1)) as usize;
        match V::WIDTH {
            AccessWidth::Byte => u32::from(self.dcache[offset]),
            AccessWidth::HalfWord => u32::from(u16::from_le_bytes([
                self.dcache[offset],
                self.dcache[offset + 1],
            ])),
            AccessWidth::Word => {
                u32::from_le_bytes(self.dcache[offset..offset + 4].try_into().unwrap())
            }
        }
    }

    fn write_scratchpad<V: MemoryValue>(&mut self, physical_address: u32, value: u32) {
        let offset =
            ((physical_address & DCACHE_OFFSET_MASK) & !(V::WIDTH.byte_size() - 1)) as usize;
        match V::WIDTH {
            AccessWidth::Byte => self.dcache[offset] = value as u8,
            AccessWidth::HalfWord => {
                self.dcache[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes())
            }
            AccessWidth::Word => {
                self.dcache[offset..offset + 4].copy_from_slice(&value.to_le_bytes())
            }
        }
    }

    fn write_cache_control(&mut self, value: u32) {
        log::warn!("Cache control <- {:#010X}", value);
        self.cache_control = value;
    }

    /// Resolve a virtual address and perform the read. Returns the tick
    /// cost (negative on bus error) and the value.
    fn do_memory_read<V: MemoryValue>(&mut self, bus: &mut Bus, address: u32) -> (TickCount, u32) {
        match address >> 29 {
            // KUSEG below 512M and KSEG0: cached physical memory.
            0b000 | 0b100 => {
                let physical_address = address & 0x1FFF_FFFF;
                if Self::scratchpad_hit(physical_address) {
                    return (0, self.read_scratchpad::<V>(physical_address));
                }
                bus.dispatch_read::<V>(physical_address)
            }

            // KUSEG above 512M: nothing mapped.
            0b001 | 0b010 | 0b011 => (-1, 0),

            // KSEG1: physical memory uncached. The scratchpad is not
            // reachable here; the window falls through to the bus, which
            // treats it as unmapped.
            0b101 => bus.dispatch_read::<V>(address & 0x1FFF_FFFF),

            // KSEG2: only the cache control register.
            _ => {
                if address == CACHE_CONTROL_ADDRESS {
                    (0, self.cache_control)
                } else {
                    (-1, 0)
                }
            }
        }
    }

    fn do_memory_write<V: MemoryValue>(
        &mut self,
        bus: &mut Bus,
        address: u32,
        value: u32,
    ) -> TickCount {
        match address >> 29 {
            0b000 | 0b100 => {
                // While the d-cache is isolated, stores to cached segments
                // land in the cache and never reach the bus.
                if self.cop0.cache_isolated() {
                    return 0;
                }

                let physical_address = address & 0x1FFF_FFFF;
                if Self::scratchpad_hit(physical_address) {
                    self.write_scratchpad::<V>(physical_address, value);
                    return 0;
                }
                bus.dispatch_write::<V>(physical_address, value)
            }

            0b001 | 0b010 | 0b011 => -1,

            0b101 => bus.dispatch_write::<V>(address & 0x1FFF_FFFF, value),

            _ => {
                if address == CACHE_CONTROL_ADDRESS {
                    self.write_cache_control(value);
                    0
                } else {
                    -1
                }
            }
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
