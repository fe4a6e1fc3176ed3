use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `elf_rewriter` library.
///
/// These errors represent the failure conditions that can occur while
/// parsing an ELF image, disassembling its text, building control-flow
/// graphs, and rewriting the binary. The policy is uniform: anything
/// that would make the rewritten binary untrustworthy is fatal and
/// aborts the rewrite before a single output byte is written.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while opening, reading, or writing files.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// The input is not a well-formed ELF image.
    ///
    /// Raised for bad magic bytes, an unsupported class or encoding,
    /// section tables that point outside the file, or cross-references
    /// (symbol table → string table, relocation table → symbol table)
    /// that do not hold.
    ElfMalformed {
        /// A descriptive message about the malformed structure.
        msg: Cow<'static, str>,
    },

    /// A symbol required by the rewrite is absent.
    SymbolResolve {
        /// A descriptive message naming the missing symbol.
        msg: Cow<'static, str>,
    },

    /// The decoder cannot classify a byte sequence.
    ///
    /// Fatal inside a function body; free-text regions downgrade this
    /// to a warning and keep the bytes raw.
    Disasm {
        /// A descriptive message about the undecodable bytes.
        msg: Cow<'static, str>,
    },

    /// The reconstructed control flow is inconsistent, e.g. a branch
    /// target falls inside a decoded instruction.
    CfgInconsistent {
        /// A descriptive message about the inconsistency.
        msg: Cow<'static, str>,
    },

    /// Fewer than three scratch registers are free at an
    /// instrumentation point.
    NoFreeRegisters {
        /// A descriptive message naming the point.
        msg: Cow<'static, str>,
    },

    /// The target instruction is too short for a long jump and
    /// coalescing with its successors is blocked by an incoming branch.
    NoRoomForJump {
        /// A descriptive message naming the target address.
        msg: Cow<'static, str>,
    },

    /// The reserved data arena is exhausted.
    ReservedExhausted {
        /// A descriptive message with the failing request.
        msg: Cow<'static, str>,
    },

    /// An engine operation was invoked outside its phase.
    ///
    /// This is a programmer error in the calling tool, not a property
    /// of the input binary.
    WrongPhase {
        /// A descriptive message naming the operation and phase.
        msg: Cow<'static, str>,
    },

    /// An internal precondition failed to hold.
    Logic {
        /// A descriptive message about the violated precondition.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::ElfMalformed { msg } => write!(f, "malformed ELF: {msg}"),
            Error::SymbolResolve { msg } => write!(f, "symbol resolution error: {msg}"),
            Error::Disasm { msg } => write!(f, "disassembly error: {msg}"),
            Error::CfgInconsistent { msg } => write!(f, "control-flow error: {msg}"),
            Error::NoFreeRegisters { msg } => write!(f, "no free registers: {msg}"),
            Error::NoRoomForJump { msg } => write!(f, "no room for jump: {msg}"),
            Error::ReservedExhausted { msg } => write!(f, "reserved data exhausted: {msg}"),
            Error::WrongPhase { msg } => write!(f, "wrong phase: {msg}"),
            Error::Logic { msg } => write!(f, "internal error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::Io {
            msg: value.to_string().into(),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn elf_malformed(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ElfMalformed { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn symbol_resolve_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::SymbolResolve { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn disasm_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Disasm { msg: msg.into() }
}

#[cold]
#[inline(never)]
#[allow(unused)]
pub(crate) fn cfg_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::CfgInconsistent { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn no_free_registers(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::NoFreeRegisters { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn no_room_for_jump(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::NoRoomForJump { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn reserved_exhausted(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ReservedExhausted { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn wrong_phase(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::WrongPhase { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn logic_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Logic { msg: msg.into() }
}

pub type Result<T> = core::result::Result<T, Error>;
