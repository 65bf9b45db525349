pub mod bus;
pub mod codecache;
pub mod cpu;
pub mod devices;
pub mod psx;
pub mod savestate;

pub use bus::{Bus, TickCount};
pub use cpu::Cpu;
pub use psx::System;
