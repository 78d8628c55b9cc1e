//! The assembler: pass driver, statement execution, and public API.
//!
//! Compilation iterates full passes over the source until the symbol table
//! reaches a fixed point, then runs one final emission pass that stages
//! bytes, blocks and the memory map. The bus sees nothing unless the whole
//! compile succeeds.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use z80_cpu::Bus;

use crate::config::Config;
use crate::error::{AsmError, ErrorKind, Errors};
use crate::expr::Registry;
use crate::lexer::{Line, Tok, strip_comments, tokenize};
use crate::macros::{MacroDef, MacroFrame, rename_identifiers, split_args, substitute,
    substitute_rept_counter};
use crate::output::{Block, MapKind, Staging};
use crate::source::FileProvider;
use crate::symbols::{Scope, SymbolKind, SymbolTable};
use crate::value::Value;

/// Cumulative peephole savings, signed (a rewrite may grow the code).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptStats {
    pub bytes_saved: i64,
    pub cycles_saved: i64,
}

/// Per-category peephole switches, toggled by the OPTIMIZE directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptFlags {
    pub branch_short: bool,
    pub branch_long: bool,
    pub jump_thread: bool,
    pub dce: bool,
    pub ops_xor: bool,
    pub ops_inc: bool,
    pub ops_or: bool,
    pub ops_add0: bool,
    pub ops_logic: bool,
    pub ops_sla: bool,
    pub ops_rot: bool,
    pub ops_rst: bool,
}

impl OptFlags {
    fn all_ops(mut self, on: bool) -> Self {
        self.ops_xor = on;
        self.ops_inc = on;
        self.ops_or = on;
        self.ops_add0 = on;
        self.ops_logic = on;
        self.ops_sla = on;
        self.ops_rot = on;
        self.ops_rst = on;
        self
    }

    /// OPS preset: operator idioms only.
    pub fn ops() -> Self {
        Self::default().all_ops(true)
    }

    /// SIZE preset: everything that shrinks output.
    pub fn size() -> Self {
        let mut flags = Self::default().all_ops(true);
        flags.branch_short = true;
        flags.dce = true;
        flags.jump_thread = true;
        flags
    }

    /// ALL preset.
    pub fn all() -> Self {
        let mut flags = Self::size();
        flags.branch_long = true;
        flags
    }
}

/// OPTION-controlled feature gates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Features {
    pub z80n: bool,
    pub undoc: bool,
}

/// A jump recorded for the next pass's threading decisions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpInfo {
    pub target: u16,
    pub unconditional: bool,
}

pub(crate) struct ProcFrame {
    pub full_name: String,
    pub locals: HashSet<String>,
}

/// Pass abort marker; the error is already recorded when this surfaces.
pub(crate) struct Abort;

pub(crate) type ExecResult = Result<(), Abort>;

/// The Z80 macro assembler.
pub struct Assembler {
    config: Config,
    registry: Registry,
    symbols: SymbolTable,
    staging: Staging,
    stats: OptStats,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Assembler {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Registry::default(),
            symbols: SymbolTable::default(),
            staging: Staging::new(),
            stats: OptStats::default(),
        }
    }

    /// Register a custom operator. Overriding a built-in is an error.
    pub fn add_operator(
        &mut self,
        name: &str,
        spec: crate::expr::OperatorSpec,
    ) -> Result<(), String> {
        self.registry.add_operator(name, spec)
    }

    /// Register a custom function; `arity` of -1 accepts one or more
    /// arguments.
    pub fn add_function(
        &mut self,
        name: &str,
        arity: i32,
        apply: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> Result<(), String> {
        self.registry.add_function(name, arity, Rc::new(apply))
    }

    /// Register a custom constant.
    pub fn add_constant(&mut self, name: &str, value: f64) -> Result<(), String> {
        self.registry.add_constant(name, value)
    }

    /// Register a custom directive.
    pub fn add_directive(
        &mut self,
        name: &str,
        handler: impl Fn(&mut dyn DirectiveHost, &[Tok]) -> Result<(), String> + 'static,
    ) -> Result<(), String> {
        self.registry.add_directive(name, Rc::new(handler))
    }

    /// Assemble `entry` into `bus`, starting at `org`.
    pub fn compile<B: Bus, P: FileProvider>(
        &mut self,
        bus: &mut B,
        provider: &P,
        entry: &str,
        org: u16,
    ) -> Result<(), Errors> {
        self.symbols.clear();
        self.staging.clear();
        self.stats = OptStats::default();
        let mut errors = Vec::new();

        let mut driver = Driver {
            config: &self.config,
            registry: &self.registry,
            symbols: &mut self.symbols,
            staging: &mut self.staging,
            stats: &mut self.stats,
            errors: &mut errors,
            file_names: Vec::new(),
            file_cache: HashMap::new(),
            jump_prev: HashMap::new(),
            jump_cur: HashMap::new(),
            deps: Vec::new(),
            rng: self.config.compilation.rand_seed,
            pass: 0,
            phase_var: 1,
            pass_var: 0,
            emitting: false,
            collect: false,
            org,
            logical: org,
            physical: org,
            stmt_logical: org,
            current_global: None,
            proc_stack: Vec::new(),
            proc_floor: 0,
            macro_defs: HashMap::new(),
            macro_stack: Vec::new(),
            instance_stack: Vec::new(),
            macro_counter: 0,
            rept_stack: Vec::new(),
            include_stack: Vec::new(),
            features: Features {
                z80n: self.config.compilation.enable_z80n,
                undoc: self.config.compilation.enable_undocumented,
            },
            option_stack: Vec::new(),
            optimize: OptFlags::default(),
            optimize_stack: Vec::new(),
            saw_unresolved: false,
            eval_undefined: Vec::new(),
            eval_shaky: Vec::new(),
            eval_tentative: Vec::new(),
            ended: false,
            current_file: 0,
            current_line: 0,
        };

        let ok = driver.compile_inner::<P>(provider, entry);

        if ok && errors.is_empty() {
            self.staging.flush(|address, byte| bus.write(address, byte));
            Ok(())
        } else {
            if errors.is_empty() {
                errors.push(AsmError {
                    kind: ErrorKind::Semantic,
                    message: "compilation failed".to_string(),
                    file: entry.to_string(),
                    line: 0,
                    include_chain: Vec::new(),
                });
            }
            Err(Errors(errors))
        }
    }

    /// Block list ordered by start address.
    #[must_use]
    pub fn blocks(&self) -> Vec<Block> {
        self.staging.blocks()
    }

    /// The 64 Ki-entry per-address semantic map.
    #[must_use]
    pub fn memory_map(&self) -> &[MapKind; 0x10000] {
        self.staging.memory_map()
    }

    /// Value of a symbol by fully-qualified name.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&Value> {
        self.symbols.get(name).map(|symbol| &symbol.value)
    }

    /// All symbols by name.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.symbols.iter().map(|(name, symbol)| (name.as_str(), &symbol.value))
    }

    #[must_use]
    pub fn optimization_stats(&self) -> OptStats {
        self.stats
    }
}

/// Host interface handed to custom directive handlers.
pub trait DirectiveHost {
    /// Emit instruction bytes at the current address.
    fn emit_code(&mut self, bytes: &[u8]);
    /// Emit data bytes at the current address.
    fn emit_data(&mut self, bytes: &[u8]);
    /// Evaluate an expression token slice to an integer.
    fn eval_int(&mut self, toks: &[Tok]) -> Result<i64, String>;
    /// Current logical address.
    fn logical_address(&self) -> u16;
}

/// Working state of one `compile` call, shared by the pass driver, the
/// expression evaluator, the instruction encoder, the directive engine and
/// the peephole optimizer.
pub(crate) struct Driver<'a> {
    pub config: &'a Config,
    pub registry: &'a Registry,
    pub symbols: &'a mut SymbolTable,
    pub staging: &'a mut Staging,
    pub stats: &'a mut OptStats,
    pub errors: &'a mut Vec<AsmError>,

    pub file_names: Vec<String>,
    pub file_cache: HashMap<String, Rc<Vec<Line>>>,

    // Survives across passes
    pub jump_prev: HashMap<u16, JumpInfo>,
    pub jump_cur: HashMap<u16, JumpInfo>,
    /// Constant dependency edges collected in the first pass.
    pub deps: Vec<(String, String)>,
    pub rng: u64,

    // Per-pass
    pub pass: u32,
    pub phase_var: i64,
    pub pass_var: i64,
    pub emitting: bool,
    pub collect: bool,
    pub org: u16,
    pub logical: u16,
    pub physical: u16,
    pub stmt_logical: u16,
    pub current_global: Option<String>,
    pub proc_stack: Vec<ProcFrame>,
    pub proc_floor: usize,
    pub macro_defs: HashMap<String, Rc<MacroDef>>,
    pub macro_stack: Vec<MacroFrame>,
    pub instance_stack: Vec<u32>,
    pub macro_counter: u32,
    pub rept_stack: Vec<i64>,
    pub include_stack: Vec<String>,
    pub features: Features,
    pub option_stack: Vec<Features>,
    pub optimize: OptFlags,
    pub optimize_stack: Vec<OptFlags>,
    pub saw_unresolved: bool,
    pub eval_undefined: Vec<String>,
    pub eval_shaky: Vec<String>,
    pub eval_tentative: Vec<String>,
    pub ended: bool,
    pub current_file: u32,
    pub current_line: u32,
}

impl Driver<'_> {
    fn compile_inner<P: FileProvider>(&mut self, provider: &P, entry: &str) -> bool {
        let max_passes = self.config.compilation.max_passes.max(2);

        // Exploration passes until the end-of-pass symbol table reaches a
        // fixed point. Mid-pass SET churn is expected; only the values a
        // pass leaves behind have to settle.
        let mut previous: Option<Vec<(String, Value)>> = None;
        let mut converged = false;
        for pass_number in 1..=max_passes {
            self.begin_pass(false, pass_number as i64);
            if self.run_pass(provider, entry).is_err() {
                return false;
            }
            if self.pass == 1 && self.check_dependency_cycles().is_err() {
                return false;
            }
            let snapshot = self.symbol_snapshot();
            let settled = previous.as_ref() == Some(&snapshot);
            debug!(
                "pass {pass_number}: {} symbols, settled={settled}, unresolved={}",
                snapshot.len(),
                self.saw_unresolved
            );
            previous = Some(snapshot);
            if settled {
                converged = true;
                break;
            }
        }
        if !converged {
            self.fatal_at(
                ErrorKind::Semantic,
                "source did not converge to a stable symbol table".to_string(),
                entry.to_string(),
                0,
            );
            return false;
        }

        // Final emission pass.
        self.begin_pass(true, 1);
        self.run_pass(provider, entry).is_ok()
    }

    fn symbol_snapshot(&self) -> Vec<(String, Value)> {
        let mut snapshot: Vec<(String, Value)> = self
            .symbols
            .iter()
            .map(|(name, symbol)| (name.clone(), symbol.value.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    fn begin_pass(&mut self, emitting: bool, pass_var: i64) {
        self.pass += 1;
        self.phase_var = if emitting { 2 } else { 1 };
        self.pass_var = pass_var;
        self.emitting = emitting;
        self.collect = emitting;
        self.logical = self.org;
        self.physical = self.org;
        self.stmt_logical = self.org;
        self.current_global = None;
        self.proc_stack.clear();
        self.proc_floor = 0;
        self.macro_defs.clear();
        self.macro_stack.clear();
        self.instance_stack.clear();
        self.macro_counter = 0;
        self.rept_stack.clear();
        self.include_stack.clear();
        self.features = Features {
            z80n: self.config.compilation.enable_z80n,
            undoc: self.config.compilation.enable_undocumented,
        };
        self.option_stack.clear();
        self.optimize = OptFlags::default();
        self.optimize_stack.clear();
        self.saw_unresolved = false;
        self.ended = false;
        self.symbols.changed = false;
        self.rng = self.config.compilation.rand_seed;
        self.jump_prev = std::mem::take(&mut self.jump_cur);
        if emitting {
            self.staging.clear();
            *self.stats = OptStats::default();
        }
    }

    fn run_pass<P: FileProvider>(&mut self, provider: &P, entry: &str) -> ExecResult {
        let lines = self.load_file(provider, entry)?;
        self.include_stack.push(entry.to_string());
        let result = self.exec_lines(provider, &lines);
        self.include_stack.pop();
        result
    }

    /// Load and comment-strip a source unit, caching the line list.
    pub(crate) fn load_file<P: FileProvider>(
        &mut self,
        provider: &P,
        identifier: &str,
    ) -> Result<Rc<Vec<Line>>, Abort> {
        if let Some(cached) = self.file_cache.get(identifier) {
            return Ok(Rc::clone(cached));
        }
        if !provider.exists(identifier) {
            self.fatal(ErrorKind::Resource, format!("file not found: {identifier}"));
            return Err(Abort);
        }
        if provider.file_size(identifier) > self.config.compilation.max_file_size {
            self.fatal(ErrorKind::Resource, format!("file too large: {identifier}"));
            return Err(Abort);
        }
        let Some(bytes) = provider.read_file(identifier) else {
            self.fatal(ErrorKind::Resource, format!("file not readable: {identifier}"));
            return Err(Abort);
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let stripped = match strip_comments(&text, &self.config.comments) {
            Ok(lines) => lines,
            Err(message) => {
                self.fatal(ErrorKind::Syntax, format!("{identifier}: {message}"));
                return Err(Abort);
            }
        };
        let file_id = self.file_names.len() as u32;
        self.file_names.push(identifier.to_string());
        let lines: Vec<Line> = stripped
            .into_iter()
            .enumerate()
            .map(|(index, text)| Line { file: file_id, number: index as u32 + 1, text })
            .collect();
        let lines = Rc::new(lines);
        self.file_cache.insert(identifier.to_string(), Rc::clone(&lines));
        Ok(lines)
    }

    // =====================================================================
    // Diagnostics
    // =====================================================================

    pub(crate) fn error(&mut self, kind: ErrorKind, message: String) {
        if self.collect {
            let file = self
                .file_names
                .get(self.current_file as usize)
                .cloned()
                .unwrap_or_default();
            self.errors.push(AsmError {
                kind,
                message,
                file,
                line: self.current_line,
                include_chain: self.include_stack.clone(),
            });
        }
    }

    /// Record unconditionally and abort the pass.
    pub(crate) fn fatal(&mut self, kind: ErrorKind, message: String) {
        let file = self
            .file_names
            .get(self.current_file as usize)
            .cloned()
            .unwrap_or_default();
        let line = self.current_line;
        self.fatal_at(kind, message, file, line);
    }

    fn fatal_at(&mut self, kind: ErrorKind, message: String, file: String, line: u32) {
        self.errors.push(AsmError {
            kind,
            message,
            file,
            line,
            include_chain: self.include_stack.clone(),
        });
    }

    // =====================================================================
    // Constant dependency cycles
    // =====================================================================

    /// Reject definition cycles among constants even when value iteration
    /// would stabilize (A EQU B / B EQU A settles at 0 but is still
    /// meaningless).
    fn check_dependency_cycles(&mut self) -> Result<(), Abort> {
        let mut cycle_node: Option<String> = None;
        {
            let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
            for (from, to) in &self.deps {
                adjacency.entry(from.as_str()).or_default().push(to.as_str());
            }
            let mut states: HashMap<&str, u8> = HashMap::new();
            let nodes: Vec<&str> = adjacency.keys().copied().collect();
            for node in nodes {
                if Self::dfs_cycle(&adjacency, &mut states, node) {
                    cycle_node = Some(node.to_string());
                    break;
                }
            }
        }
        if let Some(node) = cycle_node {
            self.fatal(
                ErrorKind::Semantic,
                format!("circular dependency involving symbol {node}"),
            );
            return Err(Abort);
        }
        Ok(())
    }

    fn dfs_cycle<'n>(
        adjacency: &HashMap<&'n str, Vec<&'n str>>,
        states: &mut HashMap<&'n str, u8>,
        node: &'n str,
    ) -> bool {
        match states.get(node) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        states.insert(node, 1);
        if let Some(next) = adjacency.get(node) {
            for &succ in next {
                if Self::dfs_cycle(adjacency, states, succ) {
                    return true;
                }
            }
        }
        states.insert(node, 2);
        false
    }

    // =====================================================================
    // Line execution
    // =====================================================================

    /// Apply macro-parameter and REPT-counter substitution to a line.
    fn substituted_text(&mut self, text: &str) -> Result<String, String> {
        let mut out;
        if let Some(frame) = self.macro_stack.last() {
            out = substitute(text, frame)?;
        } else {
            out = text.to_string();
        }
        if let Some(&counter) = self.rept_stack.last() {
            out = substitute_rept_counter(&out, counter);
        }
        Ok(out)
    }

    pub(crate) fn exec_lines<P: FileProvider>(
        &mut self,
        provider: &P,
        lines: &[Line],
    ) -> ExecResult {
        let saved_floor = self.proc_floor;
        self.proc_floor = self.proc_stack.len();
        let result = self.exec_lines_inner(provider, lines);
        if result.is_ok() && !self.ended && self.proc_stack.len() > self.proc_floor {
            let open = self.proc_stack.last().map(|frame| frame.full_name.clone());
            self.fatal(
                ErrorKind::Semantic,
                format!(
                    "PROC {} has no matching ENDP",
                    open.unwrap_or_default()
                ),
            );
            self.proc_floor = saved_floor;
            return Err(Abort);
        }
        self.proc_floor = saved_floor;
        result
    }

    fn exec_lines_inner<P: FileProvider>(
        &mut self,
        provider: &P,
        lines: &[Line],
    ) -> ExecResult {
        let mut index = 0;
        while index < lines.len() {
            if self.ended {
                break;
            }
            let line = &lines[index];
            self.current_file = line.file;
            self.current_line = line.number;
            self.stmt_logical = self.logical;

            let text = match self.substituted_text(&line.text) {
                Ok(text) => text,
                Err(message) => {
                    self.error(ErrorKind::Syntax, message);
                    index += 1;
                    continue;
                }
            };

            let (word1, rest1, word2, rest2) = leading_words(&text);
            let upper1 = word1.as_deref().map(str::to_ascii_uppercase);
            let upper2 = word2.as_deref().map(str::to_ascii_uppercase);
            let u1 = upper1.as_deref().unwrap_or("");
            let u2 = upper2.as_deref().unwrap_or("");

            // Block-structured directives take control of the index.
            if IF_FAMILY.contains(&u1) {
                index = self.exec_if(provider, lines, index, u1, &text[rest1..])?;
                continue;
            }
            if u1 == "REPT" || u1 == "WHILE" {
                index = self.exec_loop(provider, lines, index, u1, &text[rest1..])?;
                continue;
            }
            if u2 == "MACRO" {
                let name = word1.clone().unwrap_or_default();
                index = self.capture_macro(lines, index, &name, &text[rest2..])?;
                continue;
            }
            if u1 == "MACRO" {
                self.error(ErrorKind::Syntax, "MACRO requires a name label".to_string());
                index += 1;
                continue;
            }
            if matches!(u1, "ELSE" | "ENDIF" | "ENDR" | "ENDW") {
                self.error(
                    ErrorKind::Semantic,
                    format!("{u1} without a matching opener"),
                );
                index += 1;
                continue;
            }
            if u1 == "ENDM" || u2 == "ENDM" {
                self.error(ErrorKind::Semantic, "ENDM without MACRO".to_string());
                index += 1;
                continue;
            }

            // Macro invocation, bare or behind a label. A colon after the
            // first word forces it to be a label even when a macro shares
            // the name.
            let word1_has_colon = text[..rest1].trim_end().ends_with(':');
            if !word1_has_colon
                && let Some(name) = &word1
                && self.macro_defs.contains_key(name.as_str())
            {
                let def = Rc::clone(&self.macro_defs[name.as_str()]);
                self.invoke_macro(provider, &def, &text[rest1..])?;
                index += 1;
                continue;
            }
            if let (Some(label), Some(name)) = (&word1, &word2)
                && !self.is_op_word(label)
                && self.macro_defs.contains_key(name.as_str())
            {
                self.define_label(label.clone());
                let def = Rc::clone(&self.macro_defs[name.as_str()]);
                self.invoke_macro(provider, &def, &text[rest2..])?;
                index += 1;
                continue;
            }

            self.exec_statement(provider, &text)?;
            index += 1;
        }
        Ok(())
    }

    /// IF/IFDEF/IFNDEF/IFB/IFNB/IFIDN/IFDIF with optional ELSE.
    fn exec_if<P: FileProvider>(
        &mut self,
        provider: &P,
        lines: &[Line],
        start: usize,
        keyword: &str,
        rest: &str,
    ) -> Result<usize, Abort> {
        if !self.config.directives.enabled || !self.config.directives.allow_conditionals {
            self.fatal(ErrorKind::Semantic, "conditional assembly is disabled".to_string());
            return Err(Abort);
        }
        let (else_at, end_at) = self.find_if_end(lines, start)?;

        let condition = match keyword {
            "IF" => {
                let toks = self.tokenize_or_error(rest);
                match toks {
                    Some(toks) => self
                        .eval_tokens(&toks)
                        .and_then(|value| value.truthy())
                        .unwrap_or_else(|message| {
                            self.error(ErrorKind::Syntax, message);
                            false
                        }),
                    None => false,
                }
            }
            "IFDEF" | "IFNDEF" => {
                let name = rest.trim();
                let defined = self.resolve_name(name).is_some();
                (keyword == "IFDEF") == defined
            }
            "IFB" | "IFNB" => {
                let blank = rest.trim().is_empty();
                (keyword == "IFB") == blank
            }
            // Textual identity with <...> guards, case-sensitive.
            _ => {
                let args = split_args(rest);
                if args.len() != 2 {
                    self.error(
                        ErrorKind::Syntax,
                        format!("{keyword} requires two arguments"),
                    );
                    false
                } else {
                    let same = args[0] == args[1];
                    (keyword == "IFIDN") == same
                }
            }
        };

        let (body_start, body_end) = if condition {
            (start + 1, else_at.unwrap_or(end_at))
        } else {
            match else_at {
                Some(else_index) => (else_index + 1, end_at),
                None => (end_at, end_at),
            }
        };
        self.exec_lines(provider, &lines[body_start..body_end])?;
        Ok(end_at + 1)
    }

    fn find_if_end(&mut self, lines: &[Line], start: usize) -> Result<(Option<usize>, usize), Abort> {
        let mut depth = 0usize;
        let mut else_at = None;
        for (index, line) in lines.iter().enumerate().skip(start + 1) {
            let (word1, _, _, _) = leading_words(&line.text);
            let upper = word1.as_deref().map(str::to_ascii_uppercase);
            match upper.as_deref() {
                Some(word) if IF_FAMILY.contains(&word) => depth += 1,
                Some("ELSE") if depth == 0 => {
                    if else_at.is_some() {
                        self.current_line = line.number;
                        self.fatal(ErrorKind::Semantic, "duplicate ELSE".to_string());
                        return Err(Abort);
                    }
                    else_at = Some(index);
                }
                Some("ENDIF") => {
                    if depth == 0 {
                        return Ok((else_at, index));
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        self.fatal(ErrorKind::Semantic, "IF without matching ENDIF".to_string());
        Err(Abort)
    }

    /// REPT count / WHILE condition blocks.
    fn exec_loop<P: FileProvider>(
        &mut self,
        provider: &P,
        lines: &[Line],
        start: usize,
        keyword: &str,
        rest: &str,
    ) -> Result<usize, Abort> {
        if !self.config.directives.enabled || !self.config.directives.allow_repeat {
            self.fatal(ErrorKind::Semantic, "repetition directives are disabled".to_string());
            return Err(Abort);
        }
        let closer = if keyword == "REPT" { "ENDR" } else { "ENDW" };
        let end_at = self.find_matching(lines, start, &["REPT", "WHILE"], &["ENDR", "ENDW"], closer)?;
        let body = &lines[start + 1..end_at];

        if keyword == "REPT" {
            let count = self.eval_rest_int(rest).unwrap_or(0).max(0);
            for iteration in 1..=count {
                if self.ended {
                    break;
                }
                self.rept_stack.push(iteration);
                let result = self.exec_lines(provider, body);
                self.rept_stack.pop();
                result?;
            }
        } else {
            let mut guard = 0u32;
            loop {
                if self.ended {
                    break;
                }
                self.current_file = lines[start].file;
                self.current_line = lines[start].number;
                let condition = self.eval_rest_int(rest).unwrap_or(0) != 0;
                if !condition {
                    break;
                }
                guard += 1;
                if guard > 65536 {
                    self.fatal(ErrorKind::Semantic, "WHILE loop did not terminate".to_string());
                    return Err(Abort);
                }
                self.exec_lines(provider, body)?;
            }
        }
        Ok(end_at + 1)
    }

    fn eval_rest_int(&mut self, rest: &str) -> Option<i64> {
        let toks = self.tokenize_or_error(rest)?;
        match self.eval_tokens(&toks).and_then(|value| value.as_int()) {
            Ok(value) => Some(value),
            Err(message) => {
                self.error(ErrorKind::Syntax, message);
                None
            }
        }
    }

    fn tokenize_or_error(&mut self, text: &str) -> Option<Vec<Tok>> {
        match tokenize(text) {
            Ok(toks) => Some(toks),
            Err(message) => {
                self.error(ErrorKind::Syntax, message);
                None
            }
        }
    }

    fn find_matching(
        &mut self,
        lines: &[Line],
        start: usize,
        openers: &[&str],
        closers: &[&str],
        want: &str,
    ) -> Result<usize, Abort> {
        let mut depth = 0usize;
        for (index, line) in lines.iter().enumerate().skip(start + 1) {
            let (word1, _, word2, _) = leading_words(&line.text);
            let u1 = word1.as_deref().map(str::to_ascii_uppercase);
            let u2 = word2.as_deref().map(str::to_ascii_uppercase);
            let u1 = u1.as_deref().unwrap_or("");
            let u2 = u2.as_deref().unwrap_or("");
            if openers.contains(&u1) || openers.contains(&u2) {
                depth += 1;
            } else if closers.contains(&u1) || closers.contains(&u2) {
                if depth == 0 {
                    let found = if closers.contains(&u1) { u1 } else { u2 };
                    if found != want {
                        self.current_line = line.number;
                        self.fatal(
                            ErrorKind::Semantic,
                            format!("expected {want}, found {found}"),
                        );
                        return Err(Abort);
                    }
                    return Ok(index);
                }
                depth -= 1;
            }
        }
        self.fatal(ErrorKind::Semantic, format!("missing {want}"));
        Err(Abort)
    }

    /// Capture `name MACRO params ... ENDM`.
    fn capture_macro(
        &mut self,
        lines: &[Line],
        start: usize,
        name: &str,
        params_text: &str,
    ) -> Result<usize, Abort> {
        let end_at = self.find_matching(lines, start, &["MACRO"], &["ENDM"], "ENDM")?;

        // Validate the closer: either bare ENDM or `name ENDM`.
        let closer = &lines[end_at];
        let (word1, _, word2, rest2) = leading_words(&closer.text);
        let u1 = word1.as_deref().map(str::to_ascii_uppercase);
        if u1.as_deref() == Some("ENDM") {
            let trailing = closer.text
                [closer.text.to_ascii_uppercase().find("ENDM").unwrap_or(0) + 4..]
                .trim();
            if !trailing.is_empty() {
                self.current_line = closer.number;
                self.error(ErrorKind::Syntax, "ENDM takes no arguments".to_string());
            }
        } else if word2.as_deref().map(str::to_ascii_uppercase).as_deref() == Some("ENDM") {
            let closer_name = word1.unwrap_or_default();
            if closer_name != name {
                self.current_line = closer.number;
                self.fatal(
                    ErrorKind::Semantic,
                    format!("ENDM name {closer_name} does not match macro {name}"),
                );
                return Err(Abort);
            }
            if !closer.text[rest2..].trim().is_empty() {
                self.current_line = closer.number;
                self.error(ErrorKind::Syntax, "ENDM takes no arguments".to_string());
            }
        }

        let params: Vec<String> = split_args(params_text)
            .into_iter()
            .filter(|param| !param.is_empty())
            .collect();
        let body: Vec<Line> = lines[start + 1..end_at].to_vec();
        self.macro_defs.insert(
            name.to_string(),
            Rc::new(MacroDef { name: name.to_string(), params, body }),
        );
        Ok(end_at + 1)
    }

    /// Expand and execute a macro invocation.
    fn invoke_macro<P: FileProvider>(
        &mut self,
        provider: &P,
        def: &Rc<MacroDef>,
        args_text: &str,
    ) -> ExecResult {
        if self.macro_stack.len() >= 64 {
            self.fatal(ErrorKind::Resource, "macro recursion too deep".to_string());
            return Err(Abort);
        }
        let args = split_args(args_text);
        self.macro_counter += 1;
        let instance = self.macro_counter;

        // LOCAL declarations rename to per-invocation unique identifiers
        // before any lookup can see them.
        let mut renames = HashMap::new();
        for line in &def.body {
            let (word1, rest1, _, _) = leading_words(&line.text);
            if word1.as_deref().map(str::to_ascii_uppercase).as_deref() == Some("LOCAL") {
                for name in split_args(&line.text[rest1..]) {
                    if !name.is_empty() {
                        renames.insert(name.clone(), format!("{name}@__{instance}"));
                    }
                }
            }
        }
        let expanded: Vec<Line> = def
            .body
            .iter()
            .filter(|line| {
                let (word1, _, _, _) = leading_words(&line.text);
                word1.as_deref().map(str::to_ascii_uppercase).as_deref() != Some("LOCAL")
            })
            .map(|line| {
                let text = if renames.is_empty() {
                    line.text.clone()
                } else {
                    rename_identifiers(&line.text, &renames)
                };
                Line { file: line.file, number: line.number, text }
            })
            .collect();

        let named: HashMap<String, String> = def
            .params
            .iter()
            .enumerate()
            .map(|(position, param)| {
                (param.clone(), args.get(position).cloned().unwrap_or_default())
            })
            .collect();

        self.macro_stack.push(MacroFrame { args, head: 0, named });
        self.instance_stack.push(instance);
        let result = self.exec_lines(provider, &expanded);
        self.instance_stack.pop();
        self.macro_stack.pop();
        result
    }

    // =====================================================================
    // Labels and symbol definition
    // =====================================================================

    pub(crate) fn scope_names(&self) -> Vec<String> {
        self.proc_stack.iter().map(|frame| frame.full_name.clone()).collect()
    }

    pub(crate) fn resolve_name(&self, name: &str) -> Option<String> {
        let procs = self.scope_names();
        let scope = Scope { procs: &procs, global: self.current_global.as_deref() };
        self.symbols.resolve(name, &scope)
    }

    /// Fully-qualified name a definition of `name` would create here.
    pub(crate) fn qualify_definition(&mut self, name: &str) -> Result<String, String> {
        if let Some(stripped) = name.strip_prefix('.') {
            let prefix = self
                .proc_stack
                .last()
                .map(|frame| frame.full_name.clone())
                .or_else(|| self.current_global.clone())
                .ok_or_else(|| format!("local label {name} requires a preceding label"))?;
            return Ok(format!("{prefix}.{stripped}"));
        }
        if let Some(frame) = self.proc_stack.iter().rev().find(|frame| frame.locals.contains(name))
        {
            return Ok(format!("{}.{name}", frame.full_name));
        }
        Ok(name.to_string())
    }

    pub(crate) fn definition_site(&self) -> (u32, u32, u32) {
        (
            self.current_file,
            self.current_line,
            self.instance_stack.last().copied().unwrap_or(0),
        )
    }

    pub(crate) fn define_label(&mut self, name: String) {
        let qualified = match self.qualify_definition(&name) {
            Ok(qualified) => qualified,
            Err(message) => {
                self.error(ErrorKind::Semantic, message);
                return;
            }
        };
        let site = self.definition_site();
        let value = Value::Int(i64::from(self.logical));
        let pass = self.pass;
        if let Err(message) =
            self.symbols.define(&qualified, value, SymbolKind::Label, site, pass, false)
        {
            self.error(ErrorKind::Semantic, message);
            return;
        }
        // A plain label opens a new dot-scope.
        if !name.starts_with('.') && self.proc_stack.is_empty() {
            self.current_global = Some(name);
        }
    }

    pub(crate) fn define_constant(&mut self, name: &str, kind: SymbolKind, toks: &[Tok]) {
        let qualified = match self.qualify_definition(name) {
            Ok(qualified) => qualified,
            Err(message) => {
                self.error(ErrorKind::Semantic, message);
                return;
            }
        };
        self.eval_undefined.clear();
        self.eval_shaky.clear();
        self.eval_tentative.clear();
        let value = match self.eval_tokens(toks) {
            Ok(value) => value,
            Err(message) => {
                self.error(ErrorKind::Syntax, message);
                return;
            }
        };
        let unresolved = !self.eval_undefined.is_empty() || !self.eval_shaky.is_empty();
        if self.pass == 1 {
            let refs: Vec<String> = self
                .eval_undefined
                .iter()
                .chain(self.eval_shaky.iter())
                .cloned()
                .collect();
            for referenced in refs {
                self.deps.push((qualified.clone(), referenced));
            }
        }
        let site = self.definition_site();
        let pass = self.pass;
        if let Err(message) = self.symbols.define(&qualified, value, kind, site, pass, unresolved)
        {
            self.error(ErrorKind::Semantic, message);
        }
    }
}

/// The IF-family directive keywords, which share ELSE/ENDIF matching.
pub(crate) const IF_FAMILY: &[&str] =
    &["IF", "IFDEF", "IFNDEF", "IFB", "IFNB", "IFIDN", "IFDIF"];

/// Extract the first two words of a line plus the byte offsets of the text
/// following each. A word is an identifier-like run; a trailing colon on
/// the first word is skipped.
pub(crate) fn leading_words(text: &str) -> (Option<String>, usize, Option<String>, usize) {
    fn word_at(bytes: &[u8], mut i: usize) -> (Option<String>, usize, usize) {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        let start = i;
        while i < bytes.len() {
            let ch = bytes[i] as char;
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '?' | '@' | '$') {
                i += 1;
            } else {
                break;
            }
        }
        if i == start {
            (None, start, start)
        } else {
            (
                Some(String::from_utf8_lossy(&bytes[start..i]).into_owned()),
                start,
                i,
            )
        }
    }

    let bytes = text.as_bytes();
    let (word1, _, mut end1) = word_at(bytes, 0);
    if word1.is_none() {
        return (None, 0, None, 0);
    }
    // Skip a label colon between the words.
    let mut next = end1;
    while next < bytes.len() && (bytes[next] as char).is_whitespace() {
        next += 1;
    }
    if next < bytes.len() && bytes[next] == b':' {
        end1 = next + 1;
        next += 1;
    }
    let (word2, _, end2) = word_at(bytes, next);
    (word1, end1, word2, end2)
}
