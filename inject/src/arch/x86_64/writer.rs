/// Registers in hardware encoding order. Only the ones the jump stub can use
/// are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    fn low_bits(self) -> u8 {
        self as u8 & 0b111
    }

    fn needs_rex_b(self) -> bool {
        self as u8 & 0b1000 != 0
    }
}

const REX: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_B: u8 = 0x01;

/// Appends x86-64 machine code, tracking the address of the next byte.
#[derive(Debug)]
pub struct X86_64Writer {
    code: Vec<u8>,
    pc: u64,
}

impl X86_64Writer {
    pub fn new(pc: u64) -> Self {
        Self { code: Vec::new(), pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    /// `movabs reg, imm64`
    pub fn put_movabs(&mut self, reg: Reg, imm: u64) {
        let rex = REX | REX_W | if reg.needs_rex_b() { REX_B } else { 0 };
        self.put_bytes(&[rex, 0xB8 | reg.low_bits()]);
        self.put_bytes(&imm.to_le_bytes());
    }

    /// `jmp reg` (FF /4 with a register operand)
    pub fn put_jmp_reg(&mut self, reg: Reg) {
        if reg.needs_rex_b() {
            self.put_bytes(&[REX | REX_B]);
        }
        self.put_bytes(&[0xFF, 0xE0 | reg.low_bits()]);
    }

    pub fn put_syscall(&mut self) {
        self.put_bytes(&[0x0F, 0x05]);
    }

    /// `movabs reg, addr; jmp reg`
    pub fn put_movabs_jmp(&mut self, reg: Reg, addr: u64) {
        self.put_movabs(reg, addr);
        self.put_jmp_reg(reg);
    }
}
