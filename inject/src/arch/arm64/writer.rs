/// General-purpose registers the injector touches: the syscall argument and
/// number registers, and the intra-procedure-call scratch pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    /// IP0, free to clobber at a function entry.
    X16 = 16,
    X17,
}

impl Reg {
    fn rd(self) -> u32 {
        self as u32
    }

    fn rn(self) -> u32 {
        (self as u32) << 5
    }
}

/// Appends AArch64 instructions, little-endian, tracking the address the
/// next one will execute at.
#[derive(Debug)]
pub struct Arm64Writer {
    code: Vec<u8>,
    pc: u64,
}

impl Arm64Writer {
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

    pub fn put_u32(&mut self, insn: u32) {
        self.code.extend_from_slice(&insn.to_le_bytes());
        self.pc = self.pc.wrapping_add(4);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
        self.pc = self.pc.wrapping_add(8);
    }

    /// `ldr xt, #offset` (64-bit literal load, word-aligned offset)
    pub fn put_ldr_literal(&mut self, reg: Reg, offset: u32) {
        let imm19 = (offset >> 2) & 0x7_FFFF;
        self.put_u32(0x5800_0000 | (imm19 << 5) | reg.rd());
    }

    /// `br xn`
    pub fn put_br(&mut self, reg: Reg) {
        self.put_u32(0xD61F_0000 | reg.rn());
    }

    /// `svc #imm`
    pub fn put_svc(&mut self, imm: u16) {
        self.put_u32(0xD400_0001 | ((imm as u32) << 5));
    }

    pub fn put_nop(&mut self) {
        self.put_u32(0xD503_201F);
    }

    /// `ldr reg, #8; br reg; .quad addr`
    pub fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) {
        self.put_ldr_literal(reg, 8);
        self.put_br(reg);
        self.put_u64(addr);
    }
}
