//! The failure taxonomy shared by the decode and encode paths
//!
//! Three families cover everything that can go wrong with sequence data:
//! [`FormatError`] for bytes that do not follow the binary format,
//! [`ReferenceError`] for graph references that cannot be resolved to an
//! object, and [`StructuralError`] for data that parses but violates an
//! invariant the engine relies on. The operation entry points on
//! [`Song`](crate::song::Song) wrap these in their own umbrella enums.

use thiserror::Error;

/// An error for reads that run past the end of the input buffer
#[derive(Debug, Error, PartialEq, Eq)]
#[error("a {count} byte read at {offset:#x} runs past the end of the {len} byte buffer")]
pub struct OutOfBoundsError {
    /// Offset the read started at
    pub offset: u32,

    /// Number of bytes the read wanted
    pub count: u32,

    /// Total length of the buffer
    pub len: u32,
}

/// Byte-level problems: the input does not follow the binary format
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Sequence files start with the magic literal `"BGM "`.
    #[error("bad magic {found:?}, sequence files start with \"BGM \"")]
    BadMagic { found: [u8; 4] },

    /// A field the engine requires to be zero holds something else.
    #[error("reserved field at {offset:#x} holds {value:#x}, expected zero")]
    ReservedNotZero { offset: u32, value: u32 },

    /// The opcode is not part of the command vocabulary.
    #[error("unknown command opcode {opcode:#04x} at {offset:#x}")]
    UnknownOpcode { opcode: u8, offset: u32 },

    /// The second byte of an `0xFF` escape selects a command that does not exist.
    #[error("unknown extended command {sub:#04x} at {offset:#x}")]
    UnknownExtendedOpcode { sub: u8, offset: u32 },

    /// Composition words use type nibbles 0, 1, 3 and 5; everything else is
    /// either unused by the engine or not a command at all.
    #[error("unknown composition command type {kind} at {offset:#x}")]
    UnknownCompositionCommand { kind: u8, offset: u32 },

    /// Branch commands may only appear in a track's primary stream.
    #[error("branch command outside a track stream at {offset:#x}")]
    MisplacedBranch { offset: u32 },

    /// Detour commands may only appear in a track's primary stream.
    #[error("detour command outside a track stream at {offset:#x}")]
    MisplacedDetour { offset: u32 },

    /// Branch tables hold between 1 and 16 options.
    #[error("branch option count {count} out of range, must be 1 through 16")]
    BranchOptionCountRange { count: u8 },

    /// Every branch command in one file carries the same option count.
    #[error("branch option count {found} does not match the file-wide count {expected}")]
    BranchOptionCountMismatch { expected: u8, found: u8 },

    /// The drum table must sit exactly where the header places it.
    #[error("drum table found at {found:#x}, the header places it at {expected:#x}")]
    DrumTableMisplaced { expected: u32, found: u32 },

    /// The instrument table must sit exactly where the header places it.
    #[error("instrument table found at {found:#x}, the header places it at {expected:#x}")]
    InstrumentTableMisplaced { expected: u32, found: u32 },

    /// Preset records end in a padding byte that is always zero.
    #[error("preset pad byte at {offset:#x} holds {value:#x}, expected zero")]
    PresetPadNotZero { offset: u32, value: u8 },

    /// A structure claims bytes the buffer does not have.
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBoundsError),
}

/// A reference that cannot be resolved to an object in the graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    /// A play command names a phrase serial id that does not exist.
    #[error("composition {composition} plays phrase {serial}, which does not exist")]
    UnknownPhrase { composition: usize, serial: u32 },

    /// A play command's file offset matches no decoded phrase.
    #[error("play command points at {offset:#x}, where no phrase was decoded")]
    UnresolvedPlayOffset { offset: u32 },

    /// A branch command names a serial id its track does not own.
    #[error("track refers to branch {serial}, which it does not own")]
    UnknownBranch { serial: u32 },

    /// A detour command names a serial id its track does not own.
    #[error("track refers to detour {serial}, which it does not own")]
    UnknownDetour { serial: u32 },

    /// A copy-of index must name an earlier, non-copy track in the same phrase.
    #[error("phrase {phrase} track {track} copies track {copy_of}, which is not a valid source")]
    BadCopyOf {
        phrase: u32,
        track: usize,
        copy_of: usize,
    },
}

/// Data that parses but violates an invariant the engine relies on
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuralError {
    /// Every branch option plays for exactly one measure.
    #[error("branch option runs {found} ticks, every option must run the {expected} tick measure")]
    BranchOptionDuration { expected: u32, found: u32 },

    /// Every branch carries exactly the file-wide number of options.
    #[error("branch holds {found} options, the file-wide count is {expected}")]
    BranchOptionCount { expected: u8, found: usize },

    /// The file-wide option count must stay in the 1 through 16 range.
    #[error("branch option count {count} out of range, must be 1 through 16")]
    BranchOptionsOutOfRange { count: u8 },

    /// Branch option 0 always points at the shared two-byte empty measure.
    #[error("shared empty branch stream at {offset:#x} is not a single empty measure")]
    EmptyBranchMalformed { offset: u32 },

    /// A detour stream must stop exactly at its externally carried length.
    #[error("detour stream at {offset:#x} read {read} bytes against a limit of {limit}")]
    DetourOverrun { offset: u32, limit: u32, read: u32 },

    /// The two-byte delay form tops out at 0x877 ticks.
    #[error("a delay of {ticks} ticks cannot be encoded, the longest single delay is 0x877")]
    DelayTooLong { ticks: u16 },

    /// The two-byte note length form tops out at 0x40BF ticks.
    #[error("a note length of {length} ticks cannot be encoded, the maximum is 0x40bf")]
    NoteTooLong { length: u16 },

    /// Pitches above 0x53 would collide with the control opcode range.
    #[error("note pitch {pitch:#x} cannot be encoded, pitches run up to 0x53")]
    PitchOutOfRange { pitch: u8 },

    /// The detour length byte holds at most 0x100 (stored as zero).
    #[error("a detour body of {len} bytes cannot be encoded, the length field holds at most 0x100")]
    DetourTooLong { len: u32 },

    /// Commands sharing one detour body must agree on its length.
    #[error("detour at {offset:#x} referenced with length {found}, an earlier command carries {expected}")]
    DetourLengthConflict {
        offset: u32,
        expected: u32,
        found: u32,
    },

    /// The shared empty branch option stores the measure as one delay byte.
    #[error(
        "a branch measure of {ticks} ticks cannot be encoded, the shared empty option holds a single delay byte (1 through 0x77)"
    )]
    BranchMeasureOutOfRange { ticks: u32 },
}
