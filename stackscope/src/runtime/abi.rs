//! Version-selected layout tables for the runtime's internal structures.
//!
//! The unwinder reads fields whose offsets moved between runtime versions.
//! Rather than scatter version checks through the walking code, each
//! supported version gets one table describing where everything lives and
//! which structural rules apply; the table is picked once at `init`.

use crate::domain::ConfigError;
use crate::runtime::RuntimeVersion;

/// How a thread state points at its innermost frame.
#[derive(Debug, Clone, Copy)]
pub enum FrameRoot {
    /// The thread state holds the frame pointer directly.
    Direct(usize),
    /// The frame pointer is reached through an intermediate control-stack
    /// record: `tstate + cframe` points at it, `+ current` inside it.
    ViaControlFrame { cframe: usize, current: usize },
}

/// How a frame's instruction index is recovered.
#[derive(Debug, Clone, Copy)]
pub enum LastiRule {
    /// The frame stores the index directly as an i32.
    Direct(usize),
    /// The frame stores a pointer into the code body; the index is the
    /// distance from the body start in code units, minus `adjust` units
    /// on generations where the pointer is pre-advanced.
    FromInstrPtr { offset: usize, adjust: u32 },
}

/// How entry/shim frames are recognised.
#[derive(Debug, Clone, Copy)]
pub enum EntryRule {
    /// No marking; each evaluation-loop invocation owns exactly one frame.
    None,
    /// A boolean flag on the frame.
    Flag(usize),
    /// An owner tag byte; `shim` marks frames the runtime inserted.
    OwnerTag { offset: usize, shim: u8 },
}

/// Where a code object keeps its bytecode.
#[derive(Debug, Clone, Copy)]
pub enum CodeBody {
    /// Inline in the code object, starting at this offset.
    Inline(usize),
    /// Behind a bytes-object field at this offset.
    Bytes(usize),
}

/// Line-location table format.
#[derive(Debug, Clone, Copy)]
pub enum LineTable {
    /// Packed entries with per-instruction ranges and columns.
    Packed,
    /// Legacy (address delta, line delta) pairs; no column data.
    Legacy,
}

/// How a suspended generator exposes its frame.
#[derive(Debug, Clone, Copy)]
pub enum GenFrame {
    /// A frame pointer plus a separate running flag byte.
    Pointer { frame: usize, running: usize },
    /// The frame is embedded in the generator; a state byte says whether it
    /// is executing or already cleared.
    Embedded { state: usize, iframe: usize },
}

/// How the index table of a mirrored dictionary is sized.
#[derive(Debug, Clone, Copy)]
pub enum DictIndex {
    /// `1 << log2_index_bytes`, from a byte field in the keys header.
    Log2 { offset: usize },
    /// `size * 8`, from a slot-count field in the keys header.
    Flat { size_offset: usize },
}

/// How a generator's yield-from link is validated before following it.
#[derive(Debug, Clone, Copy)]
pub enum YieldCheck {
    /// The unit after the current instruction must be a RESUME whose
    /// argument marks a resumption inside an await.
    NextUnitResume,
    /// The code byte after the current instruction must be the yield-from
    /// opcode.
    CodeByte { opcode: u8 },
}

/// Complete layout description for one runtime version.
#[derive(Debug)]
pub struct Abi {
    pub version: (u16, u16),

    // Generic object header.
    pub ob_type: usize,
    pub type_name: usize,

    // Runtime root and interpreter list.
    pub runtime_interp_head: usize,
    pub interp_next: usize,
    pub interp_id: usize,
    pub interp_threads_head: usize,

    // Thread states.
    pub tstate_next: usize,
    pub tstate_interp: usize,
    pub tstate_thread_id: usize,
    pub tstate_frame: FrameRoot,
    pub tstate_datastack_chunk: Option<usize>,

    // Interpreter frames.
    pub frame_previous: usize,
    pub frame_executable: usize,
    pub frame_lasti: LastiRule,
    pub frame_entry: EntryRule,
    pub frame_stacktop: usize,
    pub frame_localsplus: usize,

    // Code objects.
    pub code_firstlineno: usize,
    pub code_filename: usize,
    pub code_qualname: usize,
    pub code_linetable: usize,
    pub code_names: usize,
    pub code_body: CodeBody,
    pub lines: LineTable,

    // Strings, bytes, tuples.
    pub str_len: usize,
    pub str_data: usize,
    pub bytes_size: usize,
    pub bytes_data: usize,
    pub tuple_size: usize,
    pub tuple_items: usize,

    // Generators and coroutines.
    pub gen_frame: GenFrame,
    pub gen_yield_check: YieldCheck,
    pub asend_gen: usize,
    pub frame_state_executing: i8,
    pub frame_state_cleared: i8,

    // Tasks.
    pub task_loop: usize,
    pub task_coro: usize,
    pub task_name: usize,
    pub task_fut_waiter: usize,
    pub weakref_object: usize,

    // Dictionary storage.
    pub dict_keys: usize,
    pub dict_values: usize,
    pub dictkeys_nentries: usize,
    pub dictkeys_header: usize,
    pub dict_index: DictIndex,
    pub dict_entry_size: usize,
    pub dict_entry_key: usize,
    pub dict_entry_value: usize,

    // Set storage.
    pub set_mask: usize,
    pub set_table: usize,
    pub set_entry_size: usize,
    pub set_entry_key: usize,

    // Value-stack chunks.
    pub chunk_previous: usize,
    pub chunk_size: usize,

    // Opcodes consumed by call-site inference.
    pub op_cache: u8,
    pub op_push_null: u8,
    pub op_load_fast: u8,
    pub op_load_attr: u8,
    pub op_load_global: u8,
    pub op_resume: u8,
    pub op_resume_instrumented: u8,
    pub op_calls: &'static [u8],

    // Builtin-callable descriptors.
    pub cfunc_ml: usize,
    pub cfunc_self: usize,
    pub cfunc_module: usize,
    pub methoddef_name: usize,

    // Behaviour switches and well-known names.
    pub non_code_executables: bool,
    pub eval_loop_symbol: &'static str,
    pub code_type_name: &'static str,
    pub coroutine_type_names: &'static [&'static str],
    pub asend_type_name: &'static str,
    pub builtin_type_name: &'static str,
}

/// Pre-entry-marker runtimes: heap frame objects linked through a back
/// pointer, a separate bytecode object, legacy line tables.
static ABI_V10: Abi = Abi {
    version: (3, 10),

    ob_type: 8,
    type_name: 24,

    runtime_interp_head: 64,
    interp_next: 8,
    interp_id: 16,
    interp_threads_head: 72,

    tstate_next: 8,
    tstate_interp: 16,
    tstate_thread_id: 176,
    tstate_frame: FrameRoot::Direct(24),
    tstate_datastack_chunk: None,

    frame_previous: 24, // back pointer
    frame_executable: 32,
    frame_lasti: LastiRule::Direct(96),
    frame_entry: EntryRule::None,
    frame_stacktop: 100, // value-stack depth
    frame_localsplus: 48,

    code_firstlineno: 40,
    code_filename: 96,
    code_qualname: 104,
    code_linetable: 112,
    code_names: 72,
    code_body: CodeBody::Bytes(48),
    lines: LineTable::Legacy,

    str_len: 16,
    str_data: 48,
    bytes_size: 16,
    bytes_data: 32,
    tuple_size: 16,
    tuple_items: 24,

    gen_frame: GenFrame::Pointer { frame: 16, running: 80 },
    gen_yield_check: YieldCheck::CodeByte { opcode: 72 },
    asend_gen: 16,
    frame_state_executing: 0,
    frame_state_cleared: 4,

    task_loop: 16,
    task_coro: 136,
    task_name: 144,
    task_fut_waiter: 128,
    weakref_object: 16,

    dict_keys: 32,
    dict_values: 40,
    dictkeys_nentries: 32,
    dictkeys_header: 40,
    dict_index: DictIndex::Flat { size_offset: 8 },
    dict_entry_size: 24,
    dict_entry_key: 8,
    dict_entry_value: 16,

    set_mask: 32,
    set_table: 40,
    set_entry_size: 16,
    set_entry_key: 0,

    chunk_previous: 0,
    chunk_size: 8,

    op_cache: 0,
    op_push_null: 0,
    op_load_fast: 124,
    op_load_attr: 106,
    op_load_global: 116,
    op_resume: 0,
    op_resume_instrumented: 0,
    op_calls: &[131, 141, 142, 161],

    cfunc_ml: 16,
    cfunc_self: 24,
    cfunc_module: 32,
    methoddef_name: 0,

    non_code_executables: false,
    eval_loop_symbol: "EvalFrameDefault",
    code_type_name: "code",
    coroutine_type_names: &["coroutine", "generator", "async_generator"],
    asend_type_name: "async_generator_asend",
    builtin_type_name: "builtin_function_or_method",
};

/// First entry-marker generation: inline interpreter frames reached through
/// a control-frame record, packed line tables, embedded generator frames.
static ABI_V11: Abi = Abi {
    version: (3, 11),

    ob_type: 8,
    type_name: 24,

    runtime_interp_head: 64,
    interp_next: 8,
    interp_id: 16,
    interp_threads_head: 80,

    tstate_next: 8,
    tstate_interp: 16,
    tstate_thread_id: 152,
    tstate_frame: FrameRoot::ViaControlFrame { cframe: 56, current: 0 },
    tstate_datastack_chunk: Some(216),

    frame_previous: 40,
    frame_executable: 32,
    frame_lasti: LastiRule::FromInstrPtr { offset: 56, adjust: 0 },
    frame_entry: EntryRule::Flag(69),
    frame_stacktop: 64,
    frame_localsplus: 72,

    code_firstlineno: 104,
    code_filename: 112,
    code_qualname: 120,
    code_linetable: 128,
    code_names: 136,
    code_body: CodeBody::Inline(192),
    lines: LineTable::Packed,

    str_len: 16,
    str_data: 48,
    bytes_size: 16,
    bytes_data: 32,
    tuple_size: 16,
    tuple_items: 24,

    gen_frame: GenFrame::Embedded { state: 80, iframe: 88 },
    gen_yield_check: YieldCheck::NextUnitResume,
    asend_gen: 16,
    frame_state_executing: 0,
    frame_state_cleared: 4,

    task_loop: 16,
    task_coro: 136,
    task_name: 144,
    task_fut_waiter: 128,
    weakref_object: 16,

    dict_keys: 32,
    dict_values: 40,
    dictkeys_nentries: 24,
    dictkeys_header: 32,
    dict_index: DictIndex::Log2 { offset: 9 },
    dict_entry_size: 24,
    dict_entry_key: 8,
    dict_entry_value: 16,

    set_mask: 32,
    set_table: 40,
    set_entry_size: 16,
    set_entry_key: 0,

    chunk_previous: 0,
    chunk_size: 8,

    op_cache: 0,
    op_push_null: 2,
    op_load_fast: 124,
    op_load_attr: 106,
    op_load_global: 116,
    op_resume: 151,
    op_resume_instrumented: 0,
    op_calls: &[166, 171, 172, 142],

    cfunc_ml: 16,
    cfunc_self: 24,
    cfunc_module: 32,
    methoddef_name: 0,

    non_code_executables: false,
    eval_loop_symbol: "EvalFrameDefault",
    code_type_name: "code",
    coroutine_type_names: &["coroutine", "generator", "async_generator"],
    asend_type_name: "async_generator_asend",
    builtin_type_name: "builtin_function_or_method",
};

/// Owner-tagged frames: shim frames carry an explicit tag and must be kept
/// (hidden) for native alignment.
const ABI_V12_TABLE: Abi = Abi {
    version: (3, 12),

    ob_type: 8,
    type_name: 24,

    runtime_interp_head: 64,
    interp_next: 8,
    interp_id: 16,
    interp_threads_head: 80,

    tstate_next: 8,
    tstate_interp: 16,
    tstate_thread_id: 152,
    tstate_frame: FrameRoot::ViaControlFrame { cframe: 56, current: 0 },
    tstate_datastack_chunk: Some(216),

    frame_previous: 40,
    frame_executable: 32,
    frame_lasti: LastiRule::FromInstrPtr { offset: 56, adjust: 0 },
    frame_entry: EntryRule::OwnerTag { offset: 70, shim: 3 },
    frame_stacktop: 64,
    frame_localsplus: 72,

    code_firstlineno: 104,
    code_filename: 112,
    code_qualname: 120,
    code_linetable: 128,
    code_names: 136,
    code_body: CodeBody::Inline(192),
    lines: LineTable::Packed,

    str_len: 16,
    str_data: 40,
    bytes_size: 16,
    bytes_data: 32,
    tuple_size: 16,
    tuple_items: 24,

    gen_frame: GenFrame::Embedded { state: 80, iframe: 88 },
    gen_yield_check: YieldCheck::NextUnitResume,
    asend_gen: 16,
    frame_state_executing: 0,
    frame_state_cleared: 4,

    task_loop: 16,
    task_coro: 136,
    task_name: 144,
    task_fut_waiter: 128,
    weakref_object: 16,

    dict_keys: 32,
    dict_values: 40,
    dictkeys_nentries: 24,
    dictkeys_header: 32,
    dict_index: DictIndex::Log2 { offset: 9 },
    dict_entry_size: 24,
    dict_entry_key: 8,
    dict_entry_value: 16,

    set_mask: 32,
    set_table: 40,
    set_entry_size: 16,
    set_entry_key: 0,

    chunk_previous: 0,
    chunk_size: 8,

    op_cache: 0,
    op_push_null: 2,
    op_load_fast: 85,
    op_load_attr: 106,
    op_load_global: 116,
    op_resume: 151,
    op_resume_instrumented: 254,
    op_calls: &[171, 142],

    cfunc_ml: 16,
    cfunc_self: 24,
    cfunc_module: 32,
    methoddef_name: 0,

    non_code_executables: false,
    eval_loop_symbol: "EvalFrameDefault",
    code_type_name: "code",
    coroutine_type_names: &["coroutine", "generator", "async_generator"],
    asend_type_name: "async_generator_asend",
    builtin_type_name: "builtin_function_or_method",
};

static ABI_V12: Abi = ABI_V12_TABLE;

/// Like the owner-tag generation, but the frame pointer is direct on the
/// thread state and a frame's executable may be a non-code callable that
/// has to be skipped (or named through call-site inference at the leaf).
static ABI_V13: Abi = Abi {
    version: (3, 13),

    tstate_frame: FrameRoot::Direct(72),
    tstate_datastack_chunk: Some(224),
    frame_lasti: LastiRule::FromInstrPtr { offset: 56, adjust: 1 },
    non_code_executables: true,
    op_load_fast: 83,
    op_resume: 149,
    op_resume_instrumented: 236,
    op_calls: &[53, 57, 142],
    ..ABI_V12_TABLE
};

/// Select the layout table for a runtime version.
///
/// # Errors
/// [`ConfigError::UnsupportedVersion`] for versions without a table.
pub fn lookup(version: RuntimeVersion) -> Result<&'static Abi, ConfigError> {
    match (version.major, version.minor) {
        (3, 10) => Ok(&ABI_V10),
        (3, 11) => Ok(&ABI_V11),
        (3, 12) => Ok(&ABI_V12),
        (3, 13 | 14) => Ok(&ABI_V13),
        (major, minor) => Err(ConfigError::UnsupportedVersion { major, minor }),
    }
}
