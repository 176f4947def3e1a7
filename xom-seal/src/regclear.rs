//! What happens to register state after sealed code returns.
//!
//! Code running from execute-only memory still leaves its intermediate state
//! (round keys, counters, hash state) in registers when it returns. A sealed
//! frame can therefore be marked, once, with how much of the register file
//! has to be zeroed on the way back out. The return path looks the marking up
//! by the address of the instruction that was executing.

use crate::domain::IsolationDomain;
use crate::frame::Gfn;
use crate::PAGE_SIZE;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegClearType {
    None = 0,
    VectorOnly = 1,
    Full = 2,
}

impl RegClearType {
    /// Decode a hypercall argument. Unknown values are `None` here and are
    /// rejected by the marking operation.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(RegClearType::None),
            1 => Some(RegClearType::VectorOnly),
            2 => Some(RegClearType::Full),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn clears_vector(self) -> bool {
        self != RegClearType::None
    }

    pub fn clears_general_purpose(self) -> bool {
        self == RegClearType::Full
    }
}

/// Resolves the address of an executing instruction to the frame it lives in.
pub trait GuestTranslator {
    fn instruction_gfn(&self, rip: u64) -> Option<Gfn>;
}

/// Flat guest address space: linear address = code segment base + rip, and
/// guest-physical = linear.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityTranslator {
    pub cs_base: u64,
}

impl GuestTranslator for IdentityTranslator {
    fn instruction_gfn(&self, rip: u64) -> Option<Gfn> {
        self.cs_base
            .checked_add(rip)
            .map(|addr| Gfn(addr / PAGE_SIZE as u64))
    }
}

pub const NR_GP_REGS: usize = 16;
pub const NR_VECTOR_REGS: usize = 16;

// General purpose registers in x86 encoding order:
pub const RAX: usize = 0;
pub const RSP: usize = 4;

/// Snapshot of the register state handed back to a caller of sealed code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rip: u64,
    pub gp: [u64; NR_GP_REGS],
    /// ymm0-ymm15.
    pub vector: [[u8; 32]; NR_VECTOR_REGS],
}

impl GuestRegisters {
    pub fn new(rip: u64) -> Self {
        GuestRegisters {
            rip,
            gp: [0; NR_GP_REGS],
            vector: [[0; 32]; NR_VECTOR_REGS],
        }
    }
}

pub struct RegisterClearPolicy<'a, T: GuestTranslator> {
    domain: &'a IsolationDomain,
    translator: T,
}

impl<'a, T: GuestTranslator> RegisterClearPolicy<'a, T> {
    pub fn new(domain: &'a IsolationDomain, translator: T) -> Self {
        RegisterClearPolicy { domain, translator }
    }

    pub fn lookup(&self, rip: u64) -> RegClearType {
        self.domain.lookup_register_clear(rip, &self.translator)
    }

    /// Zero whatever the marking of the frame at `regs.rip` asks for, and
    /// return that marking. The stack pointer always survives, so the caller
    /// can still return.
    pub fn scrub(&self, regs: &mut GuestRegisters) -> RegClearType {
        let clear = self.lookup(regs.rip);

        if clear.clears_general_purpose() {
            for (i, reg) in regs.gp.iter_mut().enumerate() {
                if i != RSP {
                    *reg = 0;
                }
            }
        }

        if clear.clears_vector() {
            regs.vector = [[0; 32]; NR_VECTOR_REGS];
        }

        clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        for ty in [RegClearType::None, RegClearType::VectorOnly, RegClearType::Full] {
            assert_eq!(RegClearType::from_code(ty.code() as u64), Some(ty));
        }
        assert_eq!(RegClearType::from_code(3), None);
        assert!(RegClearType::Full.clears_vector());
        assert!(!RegClearType::VectorOnly.clears_general_purpose());
        assert!(!RegClearType::None.clears_vector());
    }

    #[test]
    fn identity_translation() {
        let t = IdentityTranslator { cs_base: 0x1000 };
        assert_eq!(t.instruction_gfn(0x2010), Some(Gfn(3)));
        assert_eq!(IdentityTranslator { cs_base: u64::MAX }.instruction_gfn(1), None);
    }

    #[test]
    fn scrub_follows_marking() {
        let d = IsolationDomain::new(crate::DomainConfig {
            nr_pages: 4,
            ..Default::default()
        })
        .unwrap();
        d.seal_whole_pages(Gfn(1), 2).unwrap();
        d.mark_register_clear(Gfn(1), RegClearType::Full).unwrap();
        d.mark_register_clear(Gfn(2), RegClearType::VectorOnly).unwrap();
        let policy = RegisterClearPolicy::new(&d, IdentityTranslator::default());

        let dirty = |rip| {
            let mut regs = GuestRegisters::new(rip);
            regs.gp = [0xdead; NR_GP_REGS];
            regs.vector = [[0xaa; 32]; NR_VECTOR_REGS];
            regs
        };

        let mut full = dirty(PAGE_SIZE as u64 + 0x10);
        assert_eq!(policy.scrub(&mut full), RegClearType::Full);
        assert_eq!(full.gp[RAX], 0);
        assert_eq!(full.gp[RSP], 0xdead);
        assert!(full.gp.iter().enumerate().all(|(i, r)| i == RSP || *r == 0));
        assert_eq!(full.vector, [[0; 32]; NR_VECTOR_REGS]);

        let mut vector = dirty(2 * PAGE_SIZE as u64);
        assert_eq!(policy.scrub(&mut vector), RegClearType::VectorOnly);
        assert_eq!(vector.gp, [0xdead; NR_GP_REGS]);
        assert_eq!(vector.vector, [[0; 32]; NR_VECTOR_REGS]);

        let mut untouched = dirty(3 * PAGE_SIZE as u64);
        assert_eq!(policy.scrub(&mut untouched), RegClearType::None);
        assert_eq!(untouched, dirty(3 * PAGE_SIZE as u64));
    }
}
