//! Selection of the enforcement backend.
//!
//! Execute-only memory is either enforced by the hypervisor through
//! second-level address translation (an execute-only permission in the
//! extended page tables), or, without a cooperating hypervisor, in user space
//! with memory protection keys: a page tagged with a key whose access is
//! disabled in PKRU can still be fetched from, but not read or written.

use std::str::FromStr;
use std::sync::Mutex;

use log::{info, warn};

/// Environment variable overriding hardware detection.
pub const XOM_MODE_ENV: &str = "XOM_MODE";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XomMode {
    Unsupported,
    PageKeyBased,
    AddressTranslationBased,
}

impl XomMode {
    pub fn is_supported(self) -> bool {
        self != XomMode::Unsupported
    }
}

impl FromStr for XomMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slat" | "ept" => Ok(XomMode::AddressTranslationBased),
            "pku" | "mpk" => Ok(XomMode::PageKeyBased),
            "none" | "unsupported" => Ok(XomMode::Unsupported),
            _ => Err(()),
        }
    }
}

static XOM_MODE: Mutex<Option<XomMode>> = Mutex::new(None);

/// The backend available on this machine. Detected once, then cached.
pub fn detect() -> XomMode {
    let mut lg = XOM_MODE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    if let Some(mode) = *lg {
        return mode;
    }

    let mode = resolve(std::env::var(XOM_MODE_ENV).ok().as_deref(), probe_hardware);

    info!("Detected XOM mode: {:?}", mode);
    *lg = Some(mode);
    mode
}

fn resolve(env: Option<&str>, probe: impl FnOnce() -> XomMode) -> XomMode {
    match env.map(|val| (val, val.parse::<XomMode>())) {
        Some((_, Ok(mode))) => {
            info!("Using XOM mode {:?} from {}", mode, XOM_MODE_ENV);
            mode
        }
        Some((val, Err(()))) => {
            warn!("Ignoring unknown {} value {:?}", XOM_MODE_ENV, val);
            probe()
        }
        None => probe(),
    }
}

#[cfg(target_arch = "x86_64")]
fn probe_hardware() -> XomMode {
    use std::arch::x86_64::{__cpuid, __cpuid_count};

    // Leaf 1, ECX bit 31: running under a hypervisor.
    #[allow(unused_unsafe)]
    let hypervisor_present = unsafe { __cpuid(1) }.ecx & (1 << 31) != 0;

    if hypervisor_present {
        // Hypervisor vendor signature in EBX:ECX:EDX of leaf 0x4000_0000.
        // The sealing hypercalls are only offered by Xen:
        #[allow(unused_unsafe)]
        let leaf = unsafe { __cpuid(0x4000_0000) };
        let mut signature = [0u8; 12];
        signature[0..4].copy_from_slice(&leaf.ebx.to_le_bytes());
        signature[4..8].copy_from_slice(&leaf.ecx.to_le_bytes());
        signature[8..12].copy_from_slice(&leaf.edx.to_le_bytes());
        if &signature == b"XenVMMXenVMM" {
            return XomMode::AddressTranslationBased;
        }
    }

    #[allow(unused_unsafe)]
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf >= 7 {
        // Leaf 7, ECX bit 3: PKU, bit 4: OSPKE (enabled by the kernel).
        #[allow(unused_unsafe)]
        let ecx = unsafe { __cpuid_count(7, 0) }.ecx;
        if ecx & (1 << 3) != 0 && ecx & (1 << 4) != 0 {
            return XomMode::PageKeyBased;
        }
    }

    XomMode::Unsupported
}

#[cfg(not(target_arch = "x86_64"))]
fn probe_hardware() -> XomMode {
    XomMode::Unsupported
}
