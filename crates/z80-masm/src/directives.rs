//! Directive engine and single-statement execution.

use std::rc::Rc;

use crate::assembler::{Driver, ExecResult, ProcFrame};
use crate::encoder::is_mnemonic;
use crate::error::ErrorKind;
use crate::expr::split_commas;
use crate::lexer::{Tok, tokenize};
use crate::output::MapKind;
use crate::source::FileProvider;
use crate::symbols::SymbolKind;
use crate::value::Value;

/// Directive keywords the engine owns; none may be overridden.
pub(crate) fn is_builtin_directive(upper: &str) -> bool {
    matches!(
        upper,
        "ORG" | "ALIGN" | "PHASE" | "DEPHASE" | "EQU" | "SET" | "DEFL" | "DEFINE" | "DB"
            | "DEFB" | "DM" | "DEFM" | "DW" | "DEFW" | "D24" | "DD" | "DEFD" | "DWORD" | "DQ"
            | "DC" | "DZ" | "ASCIZ" | "DH" | "DEFH" | "HEX" | "DS" | "DEFS" | "DG" | "DEFG"
            | "INCLUDE" | "INCBIN" | "IF" | "IFDEF" | "IFNDEF" | "IFB" | "IFNB" | "IFIDN"
            | "IFDIF" | "ELSE" | "ENDIF" | "REPT" | "ENDR" | "WHILE" | "ENDW" | "MACRO"
            | "ENDM" | "SHIFT" | "LOCAL" | "PROC" | "ENDP" | "OPTION" | "OPTIMIZE" | "END"
    )
}

impl Driver<'_> {
    /// Advance the counters and, on the emission pass, stage the bytes.
    pub(crate) fn emit_bytes(&mut self, bytes: &[u8], code: bool) {
        if self.emitting && !bytes.is_empty() {
            let kinds: Vec<MapKind> = if code {
                std::iter::once(MapKind::Opcode)
                    .chain(std::iter::repeat(MapKind::Operand))
                    .take(bytes.len())
                    .collect()
            } else {
                vec![MapKind::Data; bytes.len()]
            };
            self.staging.emit(self.physical, bytes, &kinds, code);
        }
        self.logical = self.logical.wrapping_add(bytes.len() as u16);
        self.physical = self.physical.wrapping_add(bytes.len() as u16);
    }

    /// Execute one non-block statement (already substituted).
    pub(crate) fn exec_statement<P: FileProvider>(
        &mut self,
        provider: &P,
        text: &str,
    ) -> ExecResult {
        self.stmt_logical = self.logical;
        let toks = match tokenize(text) {
            Ok(toks) => toks,
            Err(message) => {
                self.error(ErrorKind::Syntax, message);
                return Ok(());
            }
        };
        if toks.is_empty() {
            return Ok(());
        }

        // Split off a leading label.
        let mut label: Option<String> = None;
        let mut at = 0usize;
        match &toks[0] {
            Tok::Ident(first) => {
                if toks.get(1).is_some_and(|tok| tok.is_punct(":")) {
                    label = Some(first.clone());
                    at = 2;
                } else {
                    let second_is_assign = match toks.get(1) {
                        Some(Tok::Ident(word)) => matches!(
                            word.to_ascii_uppercase().as_str(),
                            "EQU" | "SET" | "DEFL" | "PROC" | "ENDP"
                        ),
                        Some(Tok::Punct("=")) => true,
                        _ => false,
                    };
                    if second_is_assign {
                        label = Some(first.clone());
                        at = 1;
                    } else if self.is_op_word(first) {
                        at = 0;
                    } else {
                        label = Some(first.clone());
                        at = 1;
                    }
                }
            }
            _ => {
                self.error(ErrorKind::Syntax, "statement must start with a label or mnemonic".to_string());
                return Ok(());
            }
        }

        if at >= toks.len() {
            if let Some(label) = label {
                self.define_label(label);
            }
            return Ok(());
        }

        let (op, args) = match &toks[at] {
            Tok::Ident(word) => (word.clone(), &toks[at + 1..]),
            Tok::Punct("=") => ("=".to_string(), &toks[at + 1..]),
            _ => {
                self.error(ErrorKind::Syntax, "expected a mnemonic or directive".to_string());
                return Ok(());
            }
        };
        let upper = op.to_ascii_uppercase();

        // Constant definitions and scope brackets bind the label
        // themselves. A bare SET with no label is the bit-set mnemonic.
        match upper.as_str() {
            "EQU" | "DEFL" | "=" => {
                self.constant_directive(&upper, label, args);
                return Ok(());
            }
            "SET" if label.is_some() => {
                self.constant_directive(&upper, label, args);
                return Ok(());
            }
            "PROC" => {
                self.proc_directive(label, args);
                return Ok(());
            }
            "ENDP" => {
                self.endp_directive(label, args);
                return Ok(());
            }
            _ => {}
        }

        if let Some(label) = label {
            self.define_label(label);
        }
        self.stmt_logical = self.logical;

        self.dispatch_op(provider, &upper, args)
    }

    pub(crate) fn is_op_word(&self, word: &str) -> bool {
        let upper = word.to_ascii_uppercase();
        is_builtin_directive(&upper)
            || is_mnemonic(&upper, self.features)
            || self.macro_defs.contains_key(word)
            || self.registry.directives.contains_key(&upper)
    }

    fn dispatch_op<P: FileProvider>(
        &mut self,
        provider: &P,
        upper: &str,
        args: &[Tok],
    ) -> ExecResult {
        let directives = &self.config.directives;
        let gate = |allowed: bool| directives.enabled && allowed;

        match upper {
            "ORG" => {
                if !gate(directives.allow_org) {
                    self.error(ErrorKind::Semantic, "ORG is disabled".to_string());
                    return Ok(());
                }
                // A still-unresolved target leaves the counters in place so
                // forward-referenced layouts can anchor on a later pass.
                if let Some(address) = self.eval_resolved_int(args) {
                    self.logical = address as u16;
                    self.physical = address as u16;
                }
            }
            "ALIGN" => {
                if !gate(directives.allow_align) {
                    self.error(ErrorKind::Semantic, "ALIGN is disabled".to_string());
                    return Ok(());
                }
                if let Some(boundary) = self.eval_arg_int(args) {
                    if boundary <= 0 {
                        self.error(ErrorKind::Semantic, "ALIGN boundary must be positive".to_string());
                        return Ok(());
                    }
                    let boundary = boundary as u16 as u32;
                    let current = u32::from(self.logical);
                    let pad = (boundary - current % boundary) % boundary;
                    let zeros = vec![0u8; pad as usize];
                    self.emit_bytes(&zeros, false);
                }
            }
            "PHASE" => {
                if !gate(directives.allow_phase) {
                    self.error(ErrorKind::Semantic, "PHASE is disabled".to_string());
                    return Ok(());
                }
                if let Some(address) = self.eval_resolved_int(args) {
                    self.logical = address as u16;
                }
            }
            "DEPHASE" => {
                if !gate(directives.allow_phase) {
                    self.error(ErrorKind::Semantic, "DEPHASE is disabled".to_string());
                    return Ok(());
                }
                self.logical = self.physical;
            }
            "DEFINE" => {
                let Some((name, rest)) = split_define(args) else {
                    self.error(ErrorKind::Syntax, "DEFINE requires a name".to_string());
                    return Ok(());
                };
                if !gate(directives.constants.enabled) {
                    self.error(ErrorKind::Semantic, "constant directives are disabled".to_string());
                    return Ok(());
                }
                self.define_constant(&name, SymbolKind::Equ, rest);
            }
            "DB" | "DEFB" | "DM" | "DEFM" => self.data_bytes(args, 1),
            "DW" | "DEFW" => self.data_bytes(args, 2),
            "D24" => self.data_bytes(args, 3),
            "DD" | "DEFD" | "DWORD" => self.data_bytes(args, 4),
            "DQ" => self.data_bytes(args, 8),
            "DC" => self.data_marked(args),
            "DZ" | "ASCIZ" => self.data_zero_terminated(args),
            "DH" | "DEFH" | "HEX" => self.data_hex(args),
            "DG" | "DEFG" => self.data_bit_pattern(args),
            "DS" | "DEFS" => self.data_space(args),
            "INCLUDE" => return self.include_directive(provider, args),
            "INCBIN" => return self.incbin_directive(provider, args),
            "LOCAL" => self.local_directive(args),
            "SHIFT" => match self.macro_stack.last_mut() {
                Some(frame) => frame.head += 1,
                None => self.error(ErrorKind::Semantic, "SHIFT outside a macro".to_string()),
            },
            "OPTION" => self.option_directive(args),
            "OPTIMIZE" => self.optimize_directive(args),
            "END" => self.ended = true,
            _ => {
                if is_mnemonic(upper, self.features) {
                    let parts = split_commas(args);
                    match self.encode_instruction(upper, &parts) {
                        Ok(bytes) => self.optimize_and_emit(bytes),
                        Err((kind, message)) => self.error(kind, message),
                    }
                    return Ok(());
                }
                if let Some(handler) = self.registry.directives.get(upper).map(Rc::clone) {
                    if let Err(message) = handler(self, args) {
                        self.error(ErrorKind::Semantic, message);
                    }
                    return Ok(());
                }
                self.error(ErrorKind::Syntax, format!("unknown mnemonic {upper}"));
            }
        }
        Ok(())
    }

    // =====================================================================
    // Constants, procedures, locals
    // =====================================================================

    fn constant_directive(&mut self, upper: &str, label: Option<String>, args: &[Tok]) {
        let constants = &self.config.directives.constants;
        let enabled = self.config.directives.enabled && constants.enabled;
        let (allowed, kind) = match upper {
            "EQU" => (constants.allow_equ, SymbolKind::Equ),
            "SET" | "DEFL" => (constants.allow_set, SymbolKind::Set),
            _ => (
                true,
                if constants.assignments_as_set { SymbolKind::Set } else { SymbolKind::Equ },
            ),
        };
        if !enabled || !allowed {
            self.error(ErrorKind::Semantic, format!("{upper} is disabled"));
            return;
        }
        let Some(name) = label else {
            self.error(ErrorKind::Syntax, format!("{upper} requires a name"));
            return;
        };
        self.define_constant(&name, kind, args);
    }

    fn proc_directive(&mut self, label: Option<String>, args: &[Tok]) {
        let name = match (label, args) {
            (Some(name), _) => name,
            (None, [Tok::Ident(name)]) => name.clone(),
            _ => {
                self.error(ErrorKind::Syntax, "PROC requires a name".to_string());
                return;
            }
        };
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
        }
        self.proc_stack.push(ProcFrame {
            full_name: qualified,
            locals: std::collections::HashSet::new(),
        });
    }

    fn endp_directive(&mut self, label: Option<String>, args: &[Tok]) {
        let name = match (label, args) {
            (Some(name), _) => Some(name),
            (None, [Tok::Ident(name)]) => Some(name.clone()),
            (None, []) => None,
            _ => {
                self.error(ErrorKind::Syntax, "bad ENDP".to_string());
                return;
            }
        };
        if self.proc_stack.len() <= self.proc_floor {
            self.error(ErrorKind::Semantic, "ENDP without PROC".to_string());
            return;
        }
        let frame = self.proc_stack.pop().expect("checked");
        if let Some(name) = name {
            let last_segment = frame.full_name.rsplit('.').next().unwrap_or("");
            let name = name.trim_start_matches('.');
            if name != frame.full_name && name != last_segment {
                self.error(
                    ErrorKind::Semantic,
                    format!("ENDP name {name} does not match PROC {}", frame.full_name),
                );
            }
        }
    }

    fn local_directive(&mut self, args: &[Tok]) {
        if self.proc_stack.len() <= self.proc_floor {
            self.error(ErrorKind::Semantic, "LOCAL outside PROC".to_string());
            return;
        }
        let mut names = Vec::new();
        for part in split_commas(args) {
            match part {
                [Tok::Ident(name)] => names.push(name.clone()),
                _ => {
                    self.error(ErrorKind::Syntax, "bad LOCAL name".to_string());
                    return;
                }
            }
        }
        let frame = self.proc_stack.last_mut().expect("checked");
        for name in names {
            frame.locals.insert(name);
        }
    }

    // =====================================================================
    // Data definition
    // =====================================================================

    fn data_parts<'t>(&mut self, args: &'t [Tok]) -> Option<Vec<&'t [Tok]>> {
        if !self.config.directives.enabled || !self.config.directives.allow_data_definitions {
            self.error(ErrorKind::Semantic, "data directives are disabled".to_string());
            return None;
        }
        let parts = split_commas(args);
        if parts.is_empty() || parts.iter().all(|part| part.is_empty()) {
            self.error(ErrorKind::Syntax, "data directive requires arguments".to_string());
            return None;
        }
        Some(parts)
    }

    fn eval_arg_int(&mut self, args: &[Tok]) -> Option<i64> {
        match self.eval_int_tokens(args) {
            Ok(value) => Some(value),
            Err(message) => {
                self.error(ErrorKind::Syntax, message);
                None
            }
        }
    }

    /// Like `eval_arg_int`, but `None` without an error when the value
    /// still depends on unresolved symbols in an exploration pass.
    fn eval_resolved_int(&mut self, args: &[Tok]) -> Option<i64> {
        self.eval_undefined.clear();
        self.eval_shaky.clear();
        self.eval_tentative.clear();
        let value = self.eval_arg_int(args)?;
        let pending = !self.eval_undefined.is_empty()
            || !self.eval_shaky.is_empty()
            || !self.eval_tentative.is_empty();
        if !self.emitting && pending {
            return None;
        }
        Some(value)
    }

    /// DB/DW/D24/DD/DQ and aliases: little-endian `width`-byte items;
    /// string arguments expand to their bytes in DB.
    fn data_bytes(&mut self, args: &[Tok], width: usize) {
        let Some(parts) = self.data_parts(args) else { return };
        let mut bytes = Vec::new();
        for part in parts {
            match self.eval_tokens(part) {
                Ok(Value::Str(text)) if width == 1 => bytes.extend_from_slice(text.as_bytes()),
                Ok(value) => match value.as_int() {
                    Ok(number) => bytes.extend_from_slice(&number.to_le_bytes()[..width]),
                    Err(message) => {
                        self.error(ErrorKind::Syntax, message);
                        return;
                    }
                },
                Err(message) => {
                    self.error(ErrorKind::Syntax, message);
                    return;
                }
            }
        }
        self.emit_bytes(&bytes, false);
    }

    /// DC: bit 7 set on the last byte of every argument.
    fn data_marked(&mut self, args: &[Tok]) {
        let Some(parts) = self.data_parts(args) else { return };
        let mut bytes = Vec::new();
        for part in parts {
            match self.eval_tokens(part) {
                Ok(Value::Str(text)) if !text.is_empty() => {
                    let raw = text.as_bytes();
                    bytes.extend_from_slice(&raw[..raw.len() - 1]);
                    bytes.push(raw[raw.len() - 1] | 0x80);
                }
                Ok(value) => match value.as_int() {
                    Ok(number) => bytes.push(number as u8 | 0x80),
                    Err(message) => {
                        self.error(ErrorKind::Syntax, message);
                        return;
                    }
                },
                Err(message) => {
                    self.error(ErrorKind::Syntax, message);
                    return;
                }
            }
        }
        self.emit_bytes(&bytes, false);
    }

    /// DZ/ASCIZ: arguments then a single terminating zero.
    fn data_zero_terminated(&mut self, args: &[Tok]) {
        let Some(parts) = self.data_parts(args) else { return };
        let mut bytes = Vec::new();
        for part in parts {
            match self.eval_tokens(part) {
                Ok(Value::Str(text)) => bytes.extend_from_slice(text.as_bytes()),
                Ok(value) => match value.as_int() {
                    Ok(number) => bytes.push(number as u8),
                    Err(message) => {
                        self.error(ErrorKind::Syntax, message);
                        return;
                    }
                },
                Err(message) => {
                    self.error(ErrorKind::Syntax, message);
                    return;
                }
            }
        }
        bytes.push(0);
        self.emit_bytes(&bytes, false);
    }

    /// DH/HEX: strings of hex digit pairs, whitespace ignored.
    fn data_hex(&mut self, args: &[Tok]) {
        let Some(parts) = self.data_parts(args) else { return };
        let mut bytes = Vec::new();
        for part in parts {
            let text = match part {
                [Tok::Str(text)] => text.clone(),
                _ => {
                    self.error(ErrorKind::Syntax, "hex directive expects string literals".to_string());
                    return;
                }
            };
            let digits: Vec<char> = text.chars().filter(|ch| !ch.is_whitespace()).collect();
            if digits.len() % 2 != 0 {
                self.error(ErrorKind::Syntax, "odd number of hex digits".to_string());
                return;
            }
            for pair in digits.chunks(2) {
                let hi = pair[0].to_digit(16);
                let lo = pair[1].to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push((hi * 16 + lo) as u8),
                    _ => {
                        self.error(
                            ErrorKind::Syntax,
                            format!("bad hex digits {}{}", pair[0], pair[1]),
                        );
                        return;
                    }
                }
            }
        }
        self.emit_bytes(&bytes, false);
    }

    /// DG: one character per bit; `1`/`X`/`-` set, `0`/`.`/`_` clear.
    fn data_bit_pattern(&mut self, args: &[Tok]) {
        let Some(parts) = self.data_parts(args) else { return };
        let mut bits = Vec::new();
        for part in parts {
            let text = match part {
                [Tok::Str(text)] => text.clone(),
                _ => {
                    self.error(ErrorKind::Syntax, "DG expects string literals".to_string());
                    return;
                }
            };
            for ch in text.chars() {
                match ch {
                    '1' | 'X' | 'x' | '-' => bits.push(true),
                    '0' | '.' | '_' => bits.push(false),
                    ch if ch.is_whitespace() => {}
                    other => {
                        self.error(ErrorKind::Syntax, format!("bad DG character {other:?}"));
                        return;
                    }
                }
            }
        }
        if bits.is_empty() || bits.len() % 8 != 0 {
            self.error(
                ErrorKind::Syntax,
                "DG pattern length must be a multiple of 8".to_string(),
            );
            return;
        }
        let bytes: Vec<u8> = bits
            .chunks(8)
            .map(|chunk| chunk.iter().fold(0u8, |acc, &bit| (acc << 1) | u8::from(bit)))
            .collect();
        self.emit_bytes(&bytes, false);
    }

    /// DS count [, fill]
    fn data_space(&mut self, args: &[Tok]) {
        let Some(parts) = self.data_parts(args) else { return };
        if parts.len() > 2 {
            self.error(ErrorKind::Syntax, "DS takes a count and an optional fill".to_string());
            return;
        }
        let Some(count) = self.eval_arg_int(parts[0]) else { return };
        if !(0..=0x10000).contains(&count) {
            self.error(ErrorKind::Semantic, format!("DS count {count} out of range"));
            return;
        }
        let fill = match parts.get(1) {
            Some(part) => match self.eval_arg_int(part) {
                Some(value) => value as u8,
                None => return,
            },
            None => 0,
        };
        let bytes = vec![fill; count as usize];
        self.emit_bytes(&bytes, false);
    }

    // =====================================================================
    // Inclusion
    // =====================================================================

    fn include_directive<P: FileProvider>(&mut self, provider: &P, args: &[Tok]) -> ExecResult {
        if !self.config.directives.enabled || !self.config.directives.allow_includes {
            self.fatal(ErrorKind::Semantic, "INCLUDE is disabled".to_string());
            return Err(crate::assembler::Abort);
        }
        let [Tok::Str(identifier)] = args else {
            self.error(ErrorKind::Syntax, "INCLUDE expects a quoted path".to_string());
            return Ok(());
        };
        let identifier = identifier.clone();
        if self.include_stack.iter().any(|entry| entry == &identifier) {
            self.fatal(
                ErrorKind::Semantic,
                format!("circular INCLUDE of {identifier}"),
            );
            return Err(crate::assembler::Abort);
        }
        if self.include_stack.len() as u32 >= self.config.compilation.max_include_depth {
            self.fatal(ErrorKind::Resource, "INCLUDE nesting too deep".to_string());
            return Err(crate::assembler::Abort);
        }
        let lines = self.load_file(provider, &identifier)?;
        let saved_file = self.current_file;
        let saved_line = self.current_line;
        self.include_stack.push(identifier);
        let result = self.exec_lines(provider, &lines);
        self.include_stack.pop();
        self.current_file = saved_file;
        self.current_line = saved_line;
        result
    }

    fn incbin_directive<P: FileProvider>(&mut self, provider: &P, args: &[Tok]) -> ExecResult {
        if !self.config.directives.enabled || !self.config.directives.allow_incbin {
            self.fatal(ErrorKind::Semantic, "INCBIN is disabled".to_string());
            return Err(crate::assembler::Abort);
        }
        let [Tok::Str(identifier)] = args else {
            self.error(ErrorKind::Syntax, "INCBIN expects a quoted path".to_string());
            return Ok(());
        };
        if !provider.exists(identifier) {
            self.fatal(ErrorKind::Resource, format!("file not found: {identifier}"));
            return Err(crate::assembler::Abort);
        }
        if provider.file_size(identifier) > self.config.compilation.max_file_size {
            self.fatal(ErrorKind::Resource, format!("file too large: {identifier}"));
            return Err(crate::assembler::Abort);
        }
        let Some(bytes) = provider.read_file(identifier) else {
            self.fatal(ErrorKind::Resource, format!("file not readable: {identifier}"));
            return Err(crate::assembler::Abort);
        };
        self.emit_bytes(&bytes, false);
        Ok(())
    }

    // =====================================================================
    // OPTION / OPTIMIZE stacks
    // =====================================================================

    fn option_directive(&mut self, args: &[Tok]) {
        // PUSH and POP stand alone.
        if let [Tok::Ident(word)] = args {
            match word.to_ascii_uppercase().as_str() {
                "PUSH" => {
                    self.option_stack.push(self.features);
                    return;
                }
                "POP" => {
                    match self.option_stack.pop() {
                        Some(saved) => self.features = saved,
                        None => {
                            self.error(ErrorKind::Semantic, "OPTION POP with empty stack".to_string());
                        }
                    }
                    return;
                }
                _ => {}
            }
        }
        let mut index = 0;
        if args.is_empty() {
            self.error(ErrorKind::Syntax, "OPTION requires arguments".to_string());
            return;
        }
        while index < args.len() {
            let enable = match &args[index] {
                Tok::Punct("+") => true,
                Tok::Punct("-") => false,
                Tok::Ident(word)
                    if matches!(word.to_ascii_uppercase().as_str(), "PUSH" | "POP") =>
                {
                    self.error(
                        ErrorKind::Semantic,
                        "OPTION PUSH/POP cannot be combined with flags".to_string(),
                    );
                    return;
                }
                _ => {
                    self.error(ErrorKind::Syntax, "bad OPTION argument".to_string());
                    return;
                }
            };
            let Some(Tok::Ident(flag)) = args.get(index + 1) else {
                self.error(ErrorKind::Syntax, "OPTION flag name expected".to_string());
                return;
            };
            // Host configuration is a ceiling OPTION cannot lift.
            match flag.to_ascii_uppercase().as_str() {
                "Z80N" => {
                    self.features.z80n = enable && self.config.compilation.enable_z80n;
                }
                "UNDOC" => {
                    self.features.undoc = enable && self.config.compilation.enable_undocumented;
                }
                other => {
                    self.error(ErrorKind::Semantic, format!("unknown OPTION flag {other}"));
                    return;
                }
            }
            index += 2;
        }
    }

    fn optimize_directive(&mut self, args: &[Tok]) {
        use crate::assembler::OptFlags;

        if args.is_empty() {
            self.error(ErrorKind::Syntax, "OPTIMIZE requires arguments".to_string());
            return;
        }
        let mut index = 0;
        while index < args.len() {
            match &args[index] {
                Tok::Ident(word) => {
                    match word.to_ascii_uppercase().as_str() {
                        "NONE" => self.optimize = OptFlags::default(),
                        "OPS" => self.optimize = OptFlags::ops(),
                        "SIZE" => self.optimize = OptFlags::size(),
                        "ALL" => self.optimize = OptFlags::all(),
                        "PUSH" => self.optimize_stack.push(self.optimize),
                        "POP" => match self.optimize_stack.pop() {
                            Some(saved) => self.optimize = saved,
                            None => {
                                self.error(
                                    ErrorKind::Semantic,
                                    "OPTIMIZE POP with empty stack".to_string(),
                                );
                                return;
                            }
                        },
                        other => {
                            self.error(
                                ErrorKind::Semantic,
                                format!("unknown OPTIMIZE keyword {other}"),
                            );
                            return;
                        }
                    }
                    index += 1;
                }
                Tok::Punct(sign @ ("+" | "-")) => {
                    let enable = *sign == "+";
                    let Some(Tok::Ident(flag)) = args.get(index + 1) else {
                        self.error(ErrorKind::Syntax, "OPTIMIZE flag name expected".to_string());
                        return;
                    };
                    let flags = &mut self.optimize;
                    match flag.to_ascii_uppercase().as_str() {
                        "BRANCH_SHORT" => flags.branch_short = enable,
                        "BRANCH_LONG" => flags.branch_long = enable,
                        "JUMP_THREAD" => flags.jump_thread = enable,
                        "DCE" => flags.dce = enable,
                        "OPS_XOR" => flags.ops_xor = enable,
                        "OPS_INC" => flags.ops_inc = enable,
                        "OPS_OR" => flags.ops_or = enable,
                        "OPS_ADD0" => flags.ops_add0 = enable,
                        "OPS_LOGIC" => flags.ops_logic = enable,
                        "OPS_SLA" => flags.ops_sla = enable,
                        "OPS_ROT" => flags.ops_rot = enable,
                        "OPS_RST" => flags.ops_rst = enable,
                        other => {
                            self.error(
                                ErrorKind::Semantic,
                                format!("unknown OPTIMIZE category {other}"),
                            );
                            return;
                        }
                    }
                    index += 2;
                }
                _ => {
                    self.error(ErrorKind::Syntax, "bad OPTIMIZE argument".to_string());
                    return;
                }
            }
        }
    }
}

/// DEFINE's name is the first identifier; the remainder is the value.
fn split_define(args: &[Tok]) -> Option<(String, &[Tok])> {
    match args {
        [Tok::Ident(name), rest @ ..] => Some((name.clone(), rest)),
        _ => None,
    }
}
