//! Simulated SAM-BA target used by the unit tests.
//!
//! The mock answers monitor commands out of a sparse memory image, executes
//! NVM controller commands the way the real controller would (erases clear
//! bytes to 0xff, the word-copy applet moves SRAM bytes into flash), and
//! records an ordered trace of NVM register accesses so tests can assert
//! the ready/command/error-check discipline and address encodings.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Transport, TransportError};
use crate::samba::crc16;

const NVM_BASE: u32 = 0x4100_4000;
const DSU_STATUSB: u32 = 0x4100_2102;
const USER_ROW: u32 = 0x80_4000;

// D2x register offsets and commands.
const D2X_CTRLA: u32 = NVM_BASE;
const D2X_INTFLAG: u32 = NVM_BASE + 0x14;
const D2X_STATUS: u32 = NVM_BASE + 0x18;
const D2X_ADDR: u32 = NVM_BASE + 0x1c;
const D2X_LOCK: u32 = NVM_BASE + 0x20;

// D5x register offsets and commands.
const D5X_CTRLB: u32 = NVM_BASE + 0x04;
const D5X_INTFLAG: u32 = NVM_BASE + 0x10;
const D5X_STATUS: u32 = NVM_BASE + 0x12;
const D5X_ADDR: u32 = NVM_BASE + 0x14;
const D5X_RUNLOCK: u32 = NVM_BASE + 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NvmModel {
    D2x,
    D5x,
}

/// One recorded access to an NVM controller register. Word accesses are
/// recorded once at their base address, byte accesses at the byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegOp {
    Read(u32),
    Write(u32, u32),
}

pub(crate) struct MockState {
    pub model: Option<NvmModel>,
    pub flash_size: u32,
    pub page_size: u32,
    pub user_region_size: u32,
    pub applet_base: u32,
    pub version: String,
    /// Sparse memory; absent flash and user-row bytes read as 0xff, all
    /// other absent bytes as 0x00.
    pub mem: BTreeMap<u32, u8>,
    pub reg_ops: Vec<RegOp>,
    /// NVM command codes in execution order.
    pub nvm_cmds: Vec<u8>,
    pub commands: Vec<String>,
    pub go_addrs: Vec<u32>,
    pub security: bool,
    pub lock_bits: u32,
    pub error_flag: bool,
    replies: VecDeque<Vec<u8>>,
    pending_write: Option<(u32, usize)>,
    buffer_src: Option<u32>,
}

impl MockState {
    fn new(model: Option<NvmModel>, flash_size: u32, page_size: u32, applet_base: u32) -> Self {
        let user_region_size = match model {
            Some(NvmModel::D2x) => page_size * 4,
            Some(NvmModel::D5x) => page_size,
            None => 0,
        };
        Self {
            model,
            flash_size,
            page_size,
            user_region_size,
            applet_base,
            version: "v1.1 Dec 15 2017 16:29:21".into(),
            mem: BTreeMap::new(),
            reg_ops: Vec::new(),
            nvm_cmds: Vec::new(),
            commands: Vec::new(),
            go_addrs: Vec::new(),
            security: false,
            lock_bits: 0xffff_ffff,
            error_flag: false,
            replies: VecDeque::new(),
            pending_write: None,
            buffer_src: None,
        }
    }

    pub fn set_word(&mut self, addr: u32, value: u32) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.mem.insert(addr + index as u32, *byte);
        }
    }

    pub fn get_byte(&self, addr: u32) -> u8 {
        self.raw8(addr)
    }

    fn in_erased_default_region(&self, addr: u32) -> bool {
        addr < self.flash_size
            || (addr >= USER_ROW && addr < USER_ROW + self.user_region_size)
    }

    fn raw8(&self, addr: u32) -> u8 {
        match self.mem.get(&addr) {
            Some(byte) => *byte,
            None if self.in_erased_default_region(addr) => 0xff,
            None => 0x00,
        }
    }

    fn raw32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.raw8(addr),
            self.raw8(addr + 1),
            self.raw8(addr + 2),
            self.raw8(addr + 3),
        ])
    }

    fn store8(&mut self, addr: u32, value: u8) {
        self.mem.insert(addr, value);
    }

    fn store32(&mut self, addr: u32, value: u32) {
        self.set_word(addr, value);
    }

    fn erase_range(&mut self, start: u32, len: u32) {
        let keys: Vec<u32> = self
            .mem
            .range(start..start + len)
            .map(|(addr, _)| *addr)
            .collect();
        for key in keys {
            self.mem.remove(&key);
        }
    }

    fn is_nvm_reg(&self, addr: u32) -> bool {
        self.model.is_some() && (NVM_BASE..NVM_BASE + 0x24).contains(&addr)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        if self.is_nvm_reg(addr) {
            self.reg_ops.push(RegOp::Read(addr));
            return match (self.model, addr) {
                (Some(NvmModel::D2x), D2X_INTFLAG) => {
                    if self.error_flag {
                        0x03
                    } else {
                        0x01
                    }
                }
                (Some(NvmModel::D2x), D2X_STATUS) => {
                    if self.security {
                        0x100
                    } else {
                        0
                    }
                }
                (Some(NvmModel::D2x), D2X_LOCK) => self.lock_bits & 0xffff,
                (Some(NvmModel::D5x), D5X_RUNLOCK) => self.lock_bits,
                _ => self.raw32(addr),
            };
        }
        self.raw32(addr)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        if self.is_nvm_reg(addr) {
            self.reg_ops.push(RegOp::Write(addr, value));
            self.store32(addr, value);
            match (self.model, addr) {
                (Some(NvmModel::D2x), D2X_CTRLA) if value & 0xff00 == 0xa500 => {
                    self.exec_d2x((value & 0xff) as u8);
                }
                (Some(NvmModel::D2x), D2X_INTFLAG) => {
                    if value & 0x02 != 0 {
                        self.error_flag = false;
                    }
                }
                _ => {}
            }
            return;
        }
        self.store32(addr, value);
    }

    fn read8(&mut self, addr: u32) -> u8 {
        if self.is_nvm_reg(addr) {
            self.reg_ops.push(RegOp::Read(addr));
            return match (self.model, addr) {
                (Some(NvmModel::D5x), D5X_STATUS) => 0x01,
                (Some(NvmModel::D5x), a) if a == D5X_STATUS + 1 => 0x00,
                (Some(NvmModel::D5x), D5X_INTFLAG) => {
                    if self.error_flag {
                        0x04
                    } else {
                        0x00
                    }
                }
                (Some(NvmModel::D5x), a) if a == D5X_INTFLAG + 1 => 0x00,
                _ => self.raw8(addr),
            };
        }
        if addr == DSU_STATUSB {
            return u8::from(self.security);
        }
        self.raw8(addr)
    }

    fn write8(&mut self, addr: u32, value: u8) {
        if self.is_nvm_reg(addr) {
            self.reg_ops.push(RegOp::Write(addr, u32::from(value)));
            self.store8(addr, value);
            match (self.model, addr) {
                (Some(NvmModel::D5x), a) if a == D5X_CTRLB + 1 && value == 0xa5 => {
                    let command = self.raw8(D5X_CTRLB);
                    self.exec_d5x(command);
                }
                (Some(NvmModel::D5x), D5X_INTFLAG) => {
                    if value & 0xce != 0 {
                        self.error_flag = false;
                    }
                }
                _ => {}
            }
            return;
        }
        self.store8(addr, value);
    }

    fn exec_d2x(&mut self, command: u8) {
        self.nvm_cmds.push(command);
        let byte_addr = self.raw32(D2X_ADDR) * 2;
        match command {
            // ER / EAR erase a row of four pages.
            0x02 | 0x05 => self.erase_range(byte_addr, self.page_size * 4),
            // SSB
            0x45 => self.security = true,
            // WP / WAP / PBC / LR / UR have no memory side effect here; the
            // applet already deposited the page data.
            _ => {}
        }
    }

    fn exec_d5x(&mut self, command: u8) {
        self.nvm_cmds.push(command);
        let byte_addr = self.raw32(D5X_ADDR);
        match command {
            // EP erases one page, EB a block of sixteen.
            0x00 => self.erase_range(byte_addr, self.page_size),
            0x01 => self.erase_range(byte_addr, self.page_size * 16),
            // SSB
            0x16 => self.security = true,
            _ => {}
        }
    }

    /// A `G` at the applet's stack cell launches the word-copy loop.
    fn run(&mut self, addr: u32) {
        self.go_addrs.push(addr);
        if self.model.is_none() {
            return;
        }
        assert_eq!(addr, self.applet_base + 0x20, "go target is not the applet stack cell");
        let dst = self.raw32(self.applet_base + 0x28);
        let src = self.raw32(self.applet_base + 0x2c);
        let words = self.raw32(self.applet_base + 0x30);
        for offset in 0..words * 4 {
            let byte = self.raw8(src + offset);
            self.store8(dst + offset, byte);
        }
    }

    fn reply(&mut self, bytes: Vec<u8>) {
        self.replies.push_back(bytes);
    }

    fn handle_command(&mut self, command: &str) {
        self.commands.push(command.to_owned());
        let letter = command.as_bytes()[0] as char;
        let mut fields = command[1..].split(',');
        let mut field = || u32::from_str_radix(fields.next().unwrap(), 16).unwrap();
        match letter {
            'N' => self.reply(b"\n\x0c".to_vec()),
            'V' => {
                let mut reply = self.version.clone().into_bytes();
                reply.extend_from_slice(b"\n\x0c");
                self.reply(reply);
            }
            'w' => {
                let addr = field();
                let value = self.read32(addr);
                self.reply(value.to_le_bytes().to_vec());
            }
            'W' => {
                let addr = field();
                let value = field();
                self.write32(addr, value);
            }
            'o' => {
                let addr = field();
                let value = self.read8(addr);
                self.reply(vec![value]);
            }
            'O' => {
                let addr = field();
                let value = field();
                self.write8(addr, value as u8);
            }
            'R' => {
                let addr = field();
                let count = field();
                let data: Vec<u8> = (0..count).map(|i| self.read8(addr + i)).collect();
                self.reply(data);
            }
            'S' => {
                let addr = field();
                let count = field();
                self.pending_write = Some((addr, count as usize));
            }
            'G' => {
                let addr = field();
                self.run(addr);
            }
            'X' => {
                let addr = field();
                self.erase_range(addr, self.flash_size - addr);
                self.reply(b"X\n\r".to_vec());
            }
            'Y' => {
                let addr = field();
                let count = field();
                if count == 0 {
                    self.buffer_src = Some(addr);
                } else {
                    let src = self.buffer_src.take().expect("Y without staged source");
                    for offset in 0..count {
                        let byte = self.raw8(src + offset);
                        self.store8(addr + offset, byte);
                    }
                }
                self.reply(b"Y\n\r".to_vec());
            }
            'Z' => {
                let addr = field();
                let count = field();
                let data: Vec<u8> = (0..count).map(|i| self.read8(addr + i)).collect();
                let crc = crc16(&data);
                self.reply(format!("Z{:08x}#\n\r", u32::from(crc)).into_bytes());
            }
            other => panic!("mock target got unknown command '{other}'"),
        }
    }

    fn handle_data(&mut self, data: &[u8]) {
        let (addr, count) = self.pending_write.take().expect("payload without S command");
        assert_eq!(data.len(), count, "payload length disagrees with S command");
        for (index, byte) in data.iter().enumerate() {
            self.store8(addr + index as u32, *byte);
        }
    }
}

pub(crate) type MockHandle = Arc<Mutex<MockState>>;

pub(crate) struct MockTransport {
    state: MockHandle,
}

impl MockTransport {
    /// A target with no NVM model, for client and identification tests.
    pub fn bare() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(None, 0, 0, 0))),
        }
    }

    /// A SAMD21J18A-shaped target: 4096 pages of 64 bytes.
    pub fn d2x() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(
                Some(NvmModel::D2x),
                4096 * 64,
                64,
                0x2000_4000,
            ))),
        }
    }

    /// A 256 KB D5x-shaped target: 512 pages of 512 bytes.
    pub fn d5x() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(
                Some(NvmModel::D5x),
                512 * 512,
                512,
                0x2000_4000,
            ))),
        }
    }

    pub fn state(&self) -> MockHandle {
        Arc::clone(&self.state)
    }
}

impl Transport for MockTransport {
    fn send_command(&mut self, command: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().handle_command(command);
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.state.lock().unwrap().handle_data(data);
        Ok(())
    }

    fn read_reply(
        &mut self,
        timeout: Duration,
        _expected: Option<usize>,
    ) -> Result<Vec<u8>, TransportError> {
        match self.state.lock().unwrap().replies.pop_front() {
            Some(reply) => Ok(reply),
            None => Err(TransportError::Timeout(timeout)),
        }
    }
}
