//! Assembler configuration.
//!
//! Host configuration is a hard ceiling: the OPTION directive can toggle
//! features at assembly time, but never re-enable what the host disabled.

/// Comment style toggles.
#[derive(Debug, Clone)]
pub struct CommentConfig {
    pub enabled: bool,
    /// Line comments introduced by `;`.
    pub allow_semicolon: bool,
    /// Line comments introduced by `//`.
    pub allow_cpp_style: bool,
    /// Block comments `/* ... */` (newlines inside are preserved).
    pub allow_block: bool,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_semicolon: true,
            allow_cpp_style: true,
            allow_block: true,
        }
    }
}

/// Constant-definition directive toggles.
#[derive(Debug, Clone)]
pub struct ConstantConfig {
    pub enabled: bool,
    pub allow_equ: bool,
    pub allow_set: bool,
    /// When true `=` behaves like SET (reassignable), else like EQU.
    pub assignments_as_set: bool,
}

impl Default for ConstantConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_equ: true,
            allow_set: true,
            assignments_as_set: true,
        }
    }
}

/// Directive-family toggles.
#[derive(Debug, Clone)]
pub struct DirectiveConfig {
    pub enabled: bool,
    pub allow_org: bool,
    pub allow_align: bool,
    pub allow_phase: bool,
    pub allow_includes: bool,
    pub allow_incbin: bool,
    pub allow_repeat: bool,
    pub allow_conditionals: bool,
    pub allow_data_definitions: bool,
    pub constants: ConstantConfig,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_org: true,
            allow_align: true,
            allow_phase: true,
            allow_includes: true,
            allow_incbin: true,
            allow_repeat: true,
            allow_conditionals: true,
            allow_data_definitions: true,
            constants: ConstantConfig::default(),
        }
    }
}

/// Compilation-wide switches and limits.
#[derive(Debug, Clone)]
pub struct CompilationConfig {
    /// Master switch for the peephole optimizer; when off, OPTIMIZE
    /// directives are accepted but change nothing.
    pub enable_optimization: bool,
    /// Z80N (Spectrum Next) mnemonics.
    pub enable_z80n: bool,
    /// Undocumented instructions (SLL, IXH/IXL/IYH/IYL, OUT (C),0, ...).
    pub enable_undocumented: bool,
    /// Upper bound on symbol-resolution passes before the source is
    /// declared non-convergent.
    pub max_passes: u32,
    pub max_include_depth: u32,
    /// Largest file the provider may hand back, in bytes.
    pub max_file_size: usize,
    /// Seed for RAND/RND/RRND; fixed so compiles are reproducible.
    pub rand_seed: u64,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            enable_optimization: true,
            enable_z80n: false,
            enable_undocumented: true,
            max_passes: 32,
            max_include_depth: 16,
            max_file_size: 4 * 1024 * 1024,
            rand_seed: 0x5DEE_CE66_D1CE_F00D,
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub comments: CommentConfig,
    pub directives: DirectiveConfig,
    pub compilation: CompilationConfig,
}
