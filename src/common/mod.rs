// # Common Types
//
// Shared identifiers and tag enums used across the watchpoint and
// FastStorage subsystems.

use serde::{Deserialize, Serialize};

/// Monotonic region identifier. Zero is reserved and never allocated.
pub type RegionId = u64;

/// Monotonic change-event sequence number, strictly increasing from 1.
pub type Seq = u64;

/// Adapter identity, stable until `unregister_adapter`.
pub type AdapterId = u32;

/// OS thread identifier, as reported by the platform.
pub type ThreadId = u64;

/// Byte address of a page-aligned page within the watched process.
pub type PageAddr = usize;

/// Source-language tag attached to a watched region (SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LanguageTag {
    GenericDynamic = 0,
    Native = 1,
    GenericJs = 2,
    Jvm = 3,
    GreenThreadNative = 4,
    OwnershipNative = 5,
    VmNative = 6,
    Sql = 7,
    Unknown = 255,
}

impl From<u8> for LanguageTag {
    fn from(v: u8) -> Self {
        match v {
            0 => LanguageTag::GenericDynamic,
            1 => LanguageTag::Native,
            2 => LanguageTag::GenericJs,
            3 => LanguageTag::Jvm,
            4 => LanguageTag::GreenThreadNative,
            5 => LanguageTag::OwnershipNative,
            6 => LanguageTag::VmNative,
            7 => LanguageTag::Sql,
            _ => LanguageTag::Unknown,
        }
    }
}

/// Visibility scope of a watched variable (SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScopeTag {
    Global = 0,
    Local = 1,
    Both = 2,
}

impl From<u8> for ScopeTag {
    fn from(v: u8) -> Self {
        match v {
            0 => ScopeTag::Global,
            1 => ScopeTag::Local,
            _ => ScopeTag::Both,
        }
    }
}
