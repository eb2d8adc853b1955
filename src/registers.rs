use serde::{Deserialize, Serialize};
use std::io::{self, Write};

macro_rules! define_registers {
    ($($reg:ident),+ $(,)?) => {
        /// Snapshot of the x86-64 general purpose register file, laid out like
        /// the kernel's `user_regs_struct`.
        #[repr(C)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
        pub struct Registers {
            $(pub $reg: u64,)+
        }

        /// Register names, in the order they are stored in the trace.
        pub const REGISTER_NAMES: &[&str] = &[$(stringify!($reg)),+];

        impl Registers {
            /// All registers in trace order.
            pub fn to_words(&self) -> [u64; REGISTER_COUNT] {
                [$(self.$reg),+]
            }
        }

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        impl From<libc::user_regs_struct> for Registers {
            fn from(regs: libc::user_regs_struct) -> Registers {
                Registers {
                    $($reg: regs.$reg as u64,)+
                }
            }
        }
    };
}

pub const REGISTER_COUNT: usize = 27;

define_registers!(
    r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip, cs,
    eflags, rsp, ss, fs_base, gs_base, ds, es, fs, gs,
);

assert_eq_size!(Registers, [u64; REGISTER_COUNT]);

impl Registers {
    pub fn original_syscallno(&self) -> isize {
        self.orig_rax as i64 as isize
    }

    /// The handful of registers that identify "where" a tracee is.
    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "rax:{:#x} rbx:{:#x} rcx:{:#x} rdx:{:#x} rsi:{:#x} rdi:{:#x} rbp:{:#x} \
             rsp:{:#x} rip:{:#x} orig_rax:{} eflags:{:#x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx,
            self.rsi,
            self.rdi,
            self.rbp,
            self.rsp,
            self.rip,
            self.original_syscallno(),
            self.eflags
        )
    }

    /// Every register, space separated, in trace order. Easy to diff.
    pub fn write_register_file_for_trace_raw(&self, out: &mut dyn Write) -> io::Result<()> {
        for w in self.to_words().iter() {
            write!(out, " {}", w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn words_keep_field_order() {
        let mut regs = Registers::default();
        regs.r15 = 1;
        regs.rip = 0x401000;
        regs.gs = 27;
        let words = regs.to_words();
        assert_eq!(words[0], 1);
        assert_eq!(words[16], 0x401000);
        assert_eq!(words[REGISTER_COUNT - 1], 27);
        assert_eq!(REGISTER_NAMES[16], "rip");
    }

    #[test]
    fn signed_views() {
        let mut regs = Registers::default();
        regs.orig_rax = (-1i64) as u64;
        assert_eq!(regs.original_syscallno(), -1);
        regs.orig_rax = 231;
        assert_eq!(regs.original_syscallno(), 231);
    }

    #[test]
    fn compact_dump() {
        let mut regs = Registers::default();
        regs.rip = 0x10;
        let mut out: Vec<u8> = Vec::new();
        regs.write_register_file_compact(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("rip:0x10"));
    }
}
