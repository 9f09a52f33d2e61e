#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Zero = 0,
    Ra = 1,
    Tp = 2,
    Sp = 3,
    A0 = 4,
    A1 = 5,
    A2 = 6,
    A3 = 7,
    A4 = 8,
    A5 = 9,
    A6 = 10,
    A7 = 11,
    T0 = 12,
    T1 = 13,
    T2 = 14,
    T3 = 15,
    T4 = 16,
    T5 = 17,
    T6 = 18,
    T7 = 19,
    T8 = 20,
    R21 = 21,
    Fp = 22,
    S0 = 23,
    S1 = 24,
    S2 = 25,
    S3 = 26,
    S4 = 27,
    S5 = 28,
    S6 = 29,
    S7 = 30,
    S8 = 31,
}

/// Little-endian LoongArch64 instruction buffer.
#[derive(Debug)]
pub struct LoongArch64Writer {
    code: Vec<u8>,
    pc: u64,
}

impl LoongArch64Writer {
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

    /// `pcaddi rd, si20`: rd = pc + (si20 << 2)
    pub fn put_pcaddi(&mut self, rd: Reg, si20: i32) {
        let imm = (si20 as u32) & 0xf_ffff;
        self.put_u32(0x1800_0000 | (imm << 5) | rd as u32);
    }

    /// `ld.d rd, rj, si12`
    pub fn put_ld_d(&mut self, rd: Reg, rj: Reg, si12: i32) {
        let imm = (si12 as u32) & 0xfff;
        self.put_u32(0x28C0_0000 | (imm << 10) | ((rj as u32) << 5) | rd as u32);
    }

    /// `jirl rd, rj, offs16` with `offset` in bytes, 4-aligned.
    pub fn put_jirl(&mut self, rd: Reg, rj: Reg, offset: i32) {
        let imm = ((offset >> 2) as u32) & 0xffff;
        self.put_u32(0x4C00_0000 | (imm << 10) | ((rj as u32) << 5) | rd as u32);
    }

    /// `andi zero, zero, 0`
    pub fn put_nop(&mut self) {
        self.put_u32(0x0340_0000);
    }

    /// `syscall code`
    pub fn put_syscall(&mut self, code: u32) {
        self.put_u32(0x002B_0000 | (code & 0x7fff));
    }

    /// Absolute jump through an inline literal:
    ///
    /// ```text
    ///   pcaddi  reg, 3        ; reg = address of the literal
    ///   ld.d    reg, reg, 0
    ///   jirl    zero, reg, 0
    ///   .quad   addr
    ///   nop
    /// ```
    pub fn put_ld_jump_address(&mut self, reg: Reg, addr: u64) {
        self.put_pcaddi(reg, 3);
        self.put_ld_d(reg, reg, 0);
        self.put_jirl(Reg::Zero, reg, 0);
        self.put_u64(addr);
        self.put_nop();
    }
}
