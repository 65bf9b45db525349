//! Save State System — snapshot and restore the bus-visible machine state.
//!
//! Binary format (little-endian):
//!   [0..4]   Magic: "PSXS"
//!   [4..8]   Version: u32
//!   [8..12]  Data size: u32 (total bytes after header)
//!   [12..]   State data (access-time triples, RAM, BIOS, MEMCTRL, TTY)
//!
//! Total size: ~2.5 MB (dominated by the 2 MiB RAM image).

use std::io;

use crate::bus::{Bus, TickCount};

const MAGIC: &[u8; 4] = b"PSXS";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("save state too small for header")]
    TooSmall,
    #[error("invalid save state magic")]
    BadMagic,
    #[error("save state version {} is newer than supported ({})", .0, VERSION)]
    UnsupportedVersion(u32),
    #[error("save state truncated: header says {expected} bytes, payload has {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("malformed save state payload: {0}")]
    Payload(#[from] io::Error),
}

// ─── Binary Writer ───────────────────────────────────────────

struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(3 * 1024 * 1024),
        }
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_tick_count(&mut self, v: TickCount) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ─── Binary Reader ───────────────────────────────────────────

struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"));
        }
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_tick_count(&mut self) -> io::Result<TickCount> {
        Ok(self.read_u32()? as TickCount)
    }

    fn read_bytes(&mut self, len: usize) -> io::Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

// ─── Capture ─────────────────────────────────────────────────

/// Capture the bus state into a byte buffer.
pub fn capture(bus: &Bus) -> Vec<u8> {
    let mut w = StateWriter::new();

    for triple in [
        &bus.exp1_access_time,
        &bus.exp2_access_time,
        &bus.bios_access_time,
        &bus.cdrom_access_time,
        &bus.spu_access_time,
    ] {
        for &ticks in triple {
            w.write_tick_count(ticks);
        }
    }

    w.write_bytes(&bus.ram);
    w.write_bytes(&bus.bios);

    for &reg in &bus.memctrl_regs {
        w.write_u32(reg);
    }
    w.write_u32(bus.ram_size_reg);

    w.write_u32(bus.tty_line_buffer.len() as u32);
    w.write_bytes(&bus.tty_line_buffer);

    // Build final file with header
    let data = w.into_bytes();
    let mut file = Vec::with_capacity(HEADER_SIZE + data.len());
    file.extend_from_slice(MAGIC);
    file.extend_from_slice(&VERSION.to_le_bytes());
    file.extend_from_slice(&(data.len() as u32).to_le_bytes());
    file.extend_from_slice(&data);
    file
}

// ─── Restore ─────────────────────────────────────────────────

/// Restore bus state from a save state byte buffer.
pub fn restore(bus: &mut Bus, data: &[u8]) -> Result<(), RestoreError> {
    if data.len() < HEADER_SIZE {
        return Err(RestoreError::TooSmall);
    }

    if &data[0..4] != MAGIC {
        return Err(RestoreError::BadMagic);
    }
    let file_version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if file_version > VERSION {
        return Err(RestoreError::UnsupportedVersion(file_version));
    }
    let data_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    let payload = &data[HEADER_SIZE..];
    if data_len > payload.len() {
        return Err(RestoreError::Truncated {
            expected: data_len,
            actual: payload.len(),
        });
    }

    let mut r = StateReader::new(payload);

    for triple in [
        &mut bus.exp1_access_time,
        &mut bus.exp2_access_time,
        &mut bus.bios_access_time,
        &mut bus.cdrom_access_time,
        &mut bus.spu_access_time,
    ] {
        for ticks in triple.iter_mut() {
            *ticks = r.read_tick_count()?;
        }
    }

    let ram_len = bus.ram.len();
    bus.ram.copy_from_slice(r.read_bytes(ram_len)?);
    let bios_len = bus.bios.len();
    bus.bios.copy_from_slice(r.read_bytes(bios_len)?);

    for reg in bus.memctrl_regs.iter_mut() {
        *reg = r.read_u32()?;
    }
    bus.ram_size_reg = r.read_u32()?;

    let tty_len = r.read_u32()? as usize;
    bus.tty_line_buffer = r.read_bytes(tty_len)?.to_vec();

    Ok(())
}
