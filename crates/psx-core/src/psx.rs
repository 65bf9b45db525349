use std::path::Path;

use crate::bus::{BiosError, Bus};
use crate::codecache::{CodeCache, NoCodeCache};
use crate::cpu::Cpu;
use crate::devices::Devices;
use crate::savestate::{self, RestoreError};

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("failed to read BIOS image: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bios(#[from] BiosError),
}

/// The top-level system: the CPU's memory-side state plus the bus with
/// everything hanging off it. The execution core drives `cpu` and `bus`
/// through the mapper entry points.
pub struct System {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl System {
    /// A system with open-bus peripherals and no recompiler attached.
    pub fn new() -> Self {
        Self::with_devices(Devices::open_bus(), Box::new(NoCodeCache))
    }

    pub fn with_devices(devices: Devices, code_cache: Box<dyn CodeCache>) -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(devices, code_cache),
        }
    }

    pub fn set_bios(&mut self, image: &[u8]) -> Result<(), BiosError> {
        self.bus.set_bios(image)
    }

    pub fn load_bios_file(&mut self, path: &Path) -> Result<(), SystemError> {
        let image = std::fs::read(path)?;
        self.bus.set_bios(&image)?;
        log::info!("Loaded BIOS image from {:?} ({} bytes)", path, image.len());
        Ok(())
    }

    /// Cold reset. The loaded BIOS image survives.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.bus.reset();
    }

    /// Snapshot the bus state. The machine must be paused (nothing here
    /// runs concurrently with the execution core).
    pub fn save_state(&self) -> Vec<u8> {
        savestate::capture(&self.bus)
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), RestoreError> {
        savestate::restore(&mut self.bus, data)
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_applies_memctrl_defaults() {
        let mut system = System::new();
        // Scramble, then reset back.
        system.bus.write_word(0x1F80_1060, 0);
        system.bus.write_word(0x1F80_1010, 0x0000_4321);
        system.reset();

        assert_eq!(system.bus.read_word(0x1F80_1000), (2, 0x1F00_0000));
        assert_eq!(system.bus.read_word(0x1F80_1004), (2, 0x1F80_2000));
        assert_eq!(system.bus.read_word(0x1F80_1008), (2, 0x0013_243F));
        assert_eq!(system.bus.read_word(0x1F80_100C), (2, 0x0000_3022));
        assert_eq!(system.bus.read_word(0x1F80_1010), (2, 0x0013_243F));
        assert_eq!(system.bus.read_word(0x1F80_1014), (2, 0x2009_31E1));
        assert_eq!(system.bus.read_word(0x1F80_1018), (2, 0x0002_0843));
        assert_eq!(system.bus.read_word(0x1F80_101C), (2, 0x0007_0777));
        assert_eq!(system.bus.read_word(0x1F80_1020), (2, 0x0003_1125));
        assert_eq!(system.bus.read_word(0x1F80_1060), (2, 0x0000_0B88));
        assert_eq!(system.bus.bios_access_time(), [6, 12, 24]);
    }

    #[test]
    fn reset_zeroes_ram_and_cpu_state() {
        let mut system = System::new();
        assert!(system.cpu.write_memory_word(&mut system.bus, 0x8000_0000, 7));
        system.cpu.pending_ticks = 55;
        system.reset();

        assert_eq!(
            system.cpu.read_memory_word(&mut system.bus, 0x8000_0000),
            Some(0)
        );
        assert_eq!(system.cpu.pending_ticks, 0);
        assert_eq!(system.cpu.pc, crate::cpu::RESET_VECTOR);
    }

    #[test]
    fn save_and_load_state_through_the_system() {
        let mut system = System::new();
        assert!(system.cpu.write_memory_word(&mut system.bus, 0x8000_0123 & !3, 0xFEED_FACE));
        let state = system.save_state();

        system.bus.write_word(0x0000_0120, 0);
        system.load_state(&state).unwrap();
        assert_eq!(
            system.cpu.read_memory_word(&mut system.bus, 0xA000_0120),
            Some(0xFEED_FACE)
        );
    }
}
