//! Peripheral register contracts.
//!
//! The bus does not model any peripheral itself; it routes register-file
//! accesses to whatever implements these traits. Each trait matches the
//! device's native register width: the CDROM file is byte-wide, the SPU is
//! halfword-wide, and everything else presents 32-bit registers (the bus
//! applies the lane fixups before the device sees the access).
//!
//! Offsets are register-local (already reduced by the device's base).

/// A device with 32-bit registers: pad/memcard, SIO, interrupt controller,
/// DMA, timers, GPU, MDEC.
pub trait WordDevice {
    fn read_register(&mut self, offset: u32) -> u32;
    fn write_register(&mut self, offset: u32, value: u32);
}

/// A device with 16-bit registers on halfword-aligned offsets (the SPU).
pub trait HalfWordDevice {
    fn read_register(&mut self, offset: u32) -> u16;
    fn write_register(&mut self, offset: u32, value: u16);
}

/// A device with 8-bit registers (the CDROM controller).
pub trait ByteDevice {
    fn read_register(&mut self, offset: u32) -> u8;
    fn write_register(&mut self, offset: u32, value: u8);
}

/// Placeholder device: reads float the bus high, writes disappear.
pub struct OpenBus;

impl WordDevice for OpenBus {
    fn read_register(&mut self, _offset: u32) -> u32 {
        0xFFFF_FFFF
    }

    fn write_register(&mut self, _offset: u32, _value: u32) {}
}

impl HalfWordDevice for OpenBus {
    fn read_register(&mut self, _offset: u32) -> u16 {
        0xFFFF
    }

    fn write_register(&mut self, _offset: u32, _value: u16) {}
}

impl ByteDevice for OpenBus {
    fn read_register(&mut self, _offset: u32) -> u8 {
        0xFF
    }

    fn write_register(&mut self, _offset: u32, _value: u8) {}
}

/// Everything hanging off the MMIO windows, injected into the bus at
/// construction. The bus owns the handles, not the devices' semantics.
pub struct Devices {
    pub pad: Box<dyn WordDevice>,
    pub sio: Box<dyn WordDevice>,
    pub interrupt_controller: Box<dyn WordDevice>,
    pub dma: Box<dyn WordDevice>,
    pub timers: Box<dyn WordDevice>,
    pub gpu: Box<dyn WordDevice>,
    pub mdec: Box<dyn WordDevice>,
    pub cdrom: Box<dyn ByteDevice>,
    pub spu: Box<dyn HalfWordDevice>,
}

impl Devices {
    /// A bundle with every slot reading as open bus. Useful for tests and
    /// for bring-up before real devices are attached.
    pub fn open_bus() -> Self {
        Self {
            pad: Box::new(OpenBus),
            sio: Box::new(OpenBus),
            interrupt_controller: Box::new(OpenBus),
            dma: Box::new(OpenBus),
            timers: Box::new(OpenBus),
            gpu: Box::new(OpenBus),
            mdec: Box::new(OpenBus),
            cdrom: Box::new(OpenBus),
            spu: Box::new(OpenBus),
        }
    }
}
