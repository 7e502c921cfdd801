//! x86-64 code generation for the FASM MS64 COFF dialect.
//!
//! The generator walks the declaration list twice: the first pass
//! registers struct/class layouts and indexes every procedure (so
//! forward references resolve), the second pass emits procedure bodies,
//! globals and extern directives. Emission is a naive stack machine:
//! every expression leaves its 64-bit value pushed on the stack, binary
//! operations pop into `rax`/`rbx`, and statements that discard a value
//! drop the trailing push.
//!
//! Calls follow the Windows x64 convention: the first four arguments
//! travel in `rcx, rdx, r8, r9`, the caller reserves 32 bytes of shadow
//! space before every `call`, and arguments past the fourth stay on the
//! stack in right-to-left order.
//!
//! Module structure:
//! - `layout.rs`: struct/class field layout and the sub-struct cache
//! - `expr.rs`: expression emission
//! - `stmt.rs`: statement and procedure emission
//! - `resolve.rs`: expression type resolution and validation

mod expr;
mod layout;
mod resolve;
mod stmt;

pub use layout::{FieldInfo, StructLayout};

use crate::ast::{ClassDecl, Decl, Field, MethodSig, ProcDecl, Type};
use crate::error::{CompileError, SourceLocation};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Windows x64 integer argument registers, in order.
pub(super) const ARGUMENT_REGISTERS: [&str; 4] = ["rcx", "rdx", "r8", "r9"];

/// Everything the generator knows about a procedure.
#[derive(Debug, Clone)]
pub(crate) struct FunctionInfo {
    pub return_type: Type,
    pub args: Vec<Field>,
    pub is_extern: bool,
    pub varargs: bool,
    pub stdcall: bool,
    /// Gates emission and extern-directive pruning.
    pub called: bool,
    pub body: Option<Vec<String>>,
    pub is_local: bool,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassInfo {
    pub methods: HashMap<String, MethodSig>,
    pub initializer: Option<MethodSig>,
}

/// A local variable's stack slot: `offset` is the distance below `rbp`.
#[derive(Debug, Clone)]
pub(crate) struct LocalSlot {
    pub size: u64,
    pub ty: Type,
    pub offset: u64,
}

/// Lexical scopes as a stack of maps. Reads walk outward to the
/// function scope; writes always target the innermost block.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    scopes: Vec<HashMap<String, LocalSlot>>,
}

impl ScopeStack {
    fn function_scope() -> Self {
        ScopeStack {
            scopes: vec![HashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    pub fn insert(&mut self, name: impl Into<String>, slot: LocalSlot) {
        if let Some(innermost) = self.scopes.last_mut() {
            innermost.insert(name.into(), slot);
        }
    }

    pub fn get(&self, name: &str) -> Option<&LocalSlot> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }
}

/// Per-translation-unit code generator. Create a fresh value per
/// compile; no state is shared between runs.
pub struct Generator {
    next_data_id: usize,
    next_label: usize,
    /// Uninitialized reservations: name, element type, count.
    bss: Vec<(String, Type, u64)>,
    /// Initialized data: name, element type, comma-joined payload.
    data: Vec<(String, Type, String)>,
    /// `extrn`/`public` directive lines, in emission order.
    externs: Vec<String>,
    functions: HashMap<String, FunctionInfo>,
    function_order: Vec<String>,
    current_function: String,
    /// Instruction lines of the procedure currently being emitted.
    body: Vec<String>,
    scopes: ScopeStack,
    globals: HashMap<String, Type>,
    struct_layouts: HashMap<String, StructLayout>,
    substruct_layouts: HashMap<usize, StructLayout>,
    classes: HashMap<String, ClassInfo>,
    enums: HashMap<String, HashMap<String, i64>>,
    local_offset: u64,
    max_align: u64,
    /// Jump targets for `break`, innermost last.
    break_stack: Vec<String>,
}

impl Default for Generator {
    fn default() -> Self {
        Generator::new()
    }
}

impl Generator {
    pub fn new() -> Self {
        Generator {
            next_data_id: 0,
            next_label: 0,
            bss: Vec::new(),
            data: Vec::new(),
            externs: Vec::new(),
            functions: HashMap::new(),
            function_order: Vec::new(),
            current_function: String::new(),
            body: Vec::new(),
            scopes: ScopeStack::default(),
            globals: HashMap::new(),
            struct_layouts: HashMap::new(),
            substruct_layouts: HashMap::new(),
            classes: HashMap::new(),
            enums: HashMap::new(),
            local_offset: 0,
            max_align: 1,
            break_stack: Vec::new(),
        }
    }

    /// Generate the full assembly text for one translation unit.
    pub fn generate(&mut self, declarations: &[Decl]) -> Result<String, CompileError> {
        // `new` allocates through the C runtime, so these are always
        // declared and considered called.
        self.register_runtime_function("malloc", Type::Ptr(None), vec![(Type::U64, "size".into())]);
        self.register_runtime_function("free", Type::Void, vec![(Type::Ptr(None), "ptr".into())]);

        // First pass: aggregate layouts and the procedure index, so
        // bodies can reference declarations that appear later.
        for decl in declarations {
            match decl {
                Decl::Struct { name, members, .. } => {
                    let layout = self.calculate_struct(members)?;
                    self.struct_layouts.insert(name.clone(), layout);
                }
                Decl::Class(class) => self.register_class(class)?,
                Decl::Procedure(proc) => self.index_procedure(proc),
                _ => {}
            }
        }

        // Second pass: emit everything else in declaration order.
        for decl in declarations {
            match decl {
                Decl::Struct { .. } | Decl::Class(_) => {}
                Decl::Procedure(proc) => self.emit_procedure(proc)?,
                Decl::Variable {
                    name,
                    ty,
                    is_local,
                    ..
                } => self.emit_global_variable(name, ty, *is_local),
                Decl::ExternProcedure {
                    name,
                    return_type,
                    args,
                    varargs,
                    stdcall,
                    location,
                } => {
                    self.functions.insert(
                        name.clone(),
                        FunctionInfo {
                            return_type: return_type.clone(),
                            args: args.clone(),
                            is_extern: true,
                            varargs: *varargs,
                            stdcall: *stdcall,
                            called: false,
                            body: None,
                            is_local: false,
                            location: Some(location.clone()),
                        },
                    );
                    self.push_directive(format!("extrn {}", name));
                }
                Decl::ExternVariable { name, ty, .. } => {
                    self.globals.insert(name.clone(), ty.clone());
                    self.push_directive(format!("extrn {}", name));
                }
                Decl::Enum { name, values } => {
                    self.enums
                        .insert(name.clone(), values.iter().cloned().collect());
                }
            }
        }

        self.assemble()
    }

    fn register_runtime_function(&mut self, name: &str, return_type: Type, args: Vec<Field>) {
        self.functions.insert(
            name.to_string(),
            FunctionInfo {
                return_type,
                args,
                is_extern: true,
                varargs: false,
                stdcall: false,
                called: true,
                body: None,
                is_local: true,
                location: None,
            },
        );
        self.externs.push(format!("extrn {}", name));
    }

    fn register_class(&mut self, class: &ClassDecl) -> Result<(), CompileError> {
        let layout = self.calculate_struct(&class.members)?;
        self.struct_layouts.insert(class.name.clone(), layout);
        self.classes.insert(
            class.name.clone(),
            ClassInfo {
                methods: class.methods.iter().cloned().collect(),
                initializer: class.initializer.clone(),
            },
        );
        Ok(())
    }

    pub(super) fn index_procedure(&mut self, proc: &ProcDecl) {
        if !self.functions.contains_key(&proc.name) {
            self.function_order.push(proc.name.clone());
        }
        self.functions.insert(
            proc.name.clone(),
            FunctionInfo {
                return_type: proc.return_type.clone(),
                args: proc.args.clone(),
                is_extern: false,
                varargs: proc.varargs,
                stdcall: proc.stdcall,
                called: proc.always_emit,
                body: None,
                is_local: proc.is_local,
                location: Some(proc.location.clone()),
            },
        );
    }

    fn emit_global_variable(&mut self, name: &str, ty: &Type, is_local: bool) {
        self.globals.insert(name.to_string(), ty.clone());
        self.bss.push((name.to_string(), ty.clone(), 1));

        if !is_local {
            self.push_directive(format!("public {}", name));
        }
    }

    fn push_directive(&mut self, directive: String) {
        if !self.externs.contains(&directive) {
            self.externs.push(directive);
        }
    }

    /// Prune unreferenced symbols and stitch the final assembly text.
    fn assemble(&mut self) -> Result<String, CompileError> {
        let mut functions_text = String::new();

        for name in &self.function_order {
            let info = &self.functions[name];

            if let Some(body) = &info.body {
                if info.called {
                    let _ = writeln!(functions_text, "{}:", name);
                    for line in body {
                        let _ = writeln!(functions_text, "    {}", line);
                    }
                    let _ = writeln!(functions_text);
                } else if !info.is_local {
                    let directive = format!("public {}", name);
                    self.externs.retain(|e| *e != directive);
                }
            } else if info.called {
                let location = info
                    .location
                    .clone()
                    .unwrap_or_else(|| SourceLocation::new("<unit>", 0, 0));
                return Err(CompileError::generate(
                    format!("Procedure '{}' was declared but never defined", name),
                    location,
                ));
            }
        }

        // Externs that nothing calls disappear from the output.
        let unused: Vec<String> = self
            .functions
            .iter()
            .filter(|(_, info)| info.is_extern && !info.called)
            .map(|(name, _)| format!("extrn {}", name))
            .collect();
        self.externs.retain(|e| !unused.contains(e));

        let externs_text = self
            .externs
            .iter()
            .map(|line| format!("    {}", line))
            .collect::<Vec<_>>()
            .join("\n");
        let data_text = self
            .data
            .iter()
            .map(|(name, ty, payload)| format!("    {}: d{} {}", name, ty.asm_letter(), payload))
            .collect::<Vec<_>>()
            .join("\n");
        let bss_text = self
            .bss
            .iter()
            .map(|(name, ty, count)| format!("    {}: r{} {}", name, ty.asm_letter(), count))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            "format MS64 COFF\n\n\
             section '.text' readable executable\n{}\n\n\
             {}\
             section '.data' readable writeable\n{}\n\n\
             section '.bss' readable writeable\n{}\n",
            externs_text, functions_text, data_text, bss_text
        ))
    }

    // Shared emission helpers.

    pub(super) fn emit(&mut self, line: impl Into<String>) {
        self.body.push(line.into());
    }

    /// Intern a string literal (raw lexeme, quotes included) into
    /// `.data`, resolving escapes and appending the NUL terminator.
    /// Returns the generated symbol name.
    pub(super) fn intern_string(&mut self, raw_lexeme: &str) -> String {
        let mut inner = raw_lexeme.chars();
        inner.next();
        inner.next_back();

        let resolved = inner
            .as_str()
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\\"", "\"")
            .replace("\\0", "\0")
            .replace("\\\\", "\\");

        let mut bytes: Vec<u8> = resolved.into_bytes();
        bytes.push(0);
        let payload = bytes
            .iter()
            .map(|b| format!("{:#x}", b))
            .collect::<Vec<_>>()
            .join(",");

        let name = format!("__str_{}", self.next_data_id);
        self.next_data_id += 1;
        self.data.push((name.clone(), Type::U8, payload));
        name
    }

    pub(super) fn reserve_bss(&mut self, ty: &Type, count: u64) -> String {
        let name = format!("__array_{}", self.next_data_id);
        self.next_data_id += 1;
        self.bss.push((name.clone(), ty.clone(), count));
        name
    }

    pub(super) fn reserve_data(&mut self, ty: &Type, payload: String) -> String {
        let name = format!("__array_{}", self.next_data_id);
        self.next_data_id += 1;
        self.data.push((name.clone(), ty.clone(), payload));
        name
    }

    /// Pad `offset` up to `align`; zero when already aligned.
    pub(super) fn padding_for(offset: u64, align: u64) -> u64 {
        let remainder = offset % align;
        if offset > 0 && remainder != 0 {
            align - remainder
        } else {
            0
        }
    }

    /// Reserve an aligned scalar slot and return its `rbp` offset.
    pub(super) fn reserve_slot(&mut self, size: u64) -> u64 {
        if size > self.max_align {
            self.max_align = size;
        }
        self.local_offset += size + Self::padding_for(self.local_offset, size);
        self.local_offset
    }

    /// An internal invariant broke; this is a compiler bug, not a user
    /// error.
    pub(super) fn bug(&self, message: impl Into<String>) -> CompileError {
        CompileError::internal(
            message,
            SourceLocation::new(
                if self.current_function.is_empty() {
                    "<unit>".to_string()
                } else {
                    self.current_function.clone()
                },
                0,
                0,
            ),
        )
    }
}

/// Narrow variant of an x86-64 register for the given operand size.
pub(super) fn register_variant(reg: &str, size: u64) -> String {
    match reg {
        "rax" | "rbx" | "rcx" | "rdx" => {
            let letter = &reg[1..2];
            match size {
                1 => format!("{}l", letter),
                2 => format!("{}x", letter),
                4 => format!("e{}x", letter),
                _ => reg.to_string(),
            }
        }
        "rdi" | "rsi" => match size {
            1 => format!("{}l", &reg[1..]),
            2 => reg[1..].to_string(),
            4 => format!("e{}", &reg[1..]),
            _ => reg.to_string(),
        },
        "r8" | "r9" | "r10" | "r11" | "r12" | "r13" | "r14" | "r15" => match size {
            1 => format!("{}b", reg),
            2 => format!("{}w", reg),
            4 => format!("{}d", reg),
            _ => reg.to_string(),
        },
        _ => reg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::preprocessor::Preprocessor;
    use crate::scanner::Scanner;

    fn compile(source: &str) -> String {
        try_compile(source).unwrap()
    }

    fn try_compile(source: &str) -> Result<String, CompileError> {
        let tokens = Scanner::new(source, "test.hz").scan()?;
        let tokens = Preprocessor::new().preprocess(tokens, &[])?;
        let declarations = Parser::new(tokens).parse()?;
        Generator::new().generate(&declarations)
    }

    fn compile_err(source: &str) -> String {
        try_compile(source).unwrap_err().to_string()
    }

    #[test]
    fn test_register_variants() {
        assert_eq!(register_variant("rax", 1), "al");
        assert_eq!(register_variant("rax", 2), "ax");
        assert_eq!(register_variant("rax", 4), "eax");
        assert_eq!(register_variant("rax", 8), "rax");
        assert_eq!(register_variant("rdx", 1), "dl");
        assert_eq!(register_variant("rsi", 4), "esi");
        assert_eq!(register_variant("rdi", 1), "dil");
        assert_eq!(register_variant("r9", 4), "r9d");
        assert_eq!(register_variant("r12", 2), "r12w");
    }

    #[test]
    fn test_main_returns_zero() {
        let asm = compile("proc main() -> i32 { return 0; }");
        assert!(asm.contains("format MS64 COFF"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("xor rax, rax"));
        assert!(asm.contains("ret"));
        assert!(asm.contains("public main"));
    }

    #[test]
    fn test_nonzero_literal_uses_mov() {
        let asm = compile("proc main() -> i32 { return 7; }");
        assert!(asm.contains("mov rax, 7"));
    }

    #[test]
    fn test_callee_spills_32bit_arguments_from_ecx_edx() {
        let asm = compile(
            "proc add(a:i32, b:i32) -> i32 { return a + b; }\n\
             proc main() -> i32 { return add(2, 3); }",
        );
        assert!(asm.contains("mov dword [rbp - 4], ecx"));
        assert!(asm.contains("mov dword [rbp - 8], edx"));
        assert!(asm.contains("call add"));
    }

    #[test]
    fn test_call_marshalling_shadow_space() {
        let asm = compile(
            "proc f(a:i64, b:i64) -> i64 { return a; }\n\
             proc main() -> i32 { return f(1, 2); }",
        );
        let lines: Vec<&str> = asm.lines().map(|l| l.trim()).collect();
        for (i, line) in lines.iter().enumerate() {
            if let Some(callee) = line.strip_prefix("call ") {
                if callee == "f" {
                    assert_eq!(lines[i - 1], "sub rsp, 32");
                    assert_eq!(lines[i + 1], "add rsp, 32");
                }
            }
        }
        assert!(asm.contains("call f"));
    }

    #[test]
    fn test_fifth_argument_stays_on_stack() {
        let asm = compile(
            "proc f(a:i64, b:i64, c:i64, d:i64, e:i64) -> i64 { return e; }\n\
             proc main() -> i32 { return f(1, 2, 3, 4, 5); }",
        );
        // Callee reads the fifth parameter above the shadow space.
        assert!(asm.contains("mov rax, qword [rbp + 48]"));
        // Caller cleans shadow space plus one stack argument.
        assert!(asm.contains("add rsp, 40"));
    }

    #[test]
    fn test_stdcall_skips_caller_cleanup() {
        let asm = compile(
            "proc stdcall f(a:i64) -> i64 { return a; }\n\
             proc main() -> i32 { return f(1); }",
        );
        let lines: Vec<&str> = asm.lines().map(|l| l.trim()).collect();
        let call_at = lines.iter().position(|l| *l == "call f").unwrap();
        assert_eq!(lines[call_at - 1], "sub rsp, 32");
        assert_ne!(lines[call_at + 1], "add rsp, 32");
    }

    #[test]
    fn test_frame_sizes_are_16_byte_aligned() {
        let asm = compile(
            "proc f() -> i64 { var a : u8; var b : i32; var c : i64; return c; }\n\
             proc main() -> i32 { return f(); }",
        );
        for line in asm.lines() {
            if let Some(size) = line.trim().strip_prefix("sub rsp, ") {
                if size != "32" {
                    let size: u64 = size.parse().unwrap();
                    assert_eq!(size % 16, 0, "frame size {} not 16-byte aligned", size);
                }
            }
        }
    }

    #[test]
    fn test_struct_field_offsets_in_emission() {
        let asm = compile(
            "struct P { x : i32; y : i32; }\n\
             proc main() -> i32 { var p : P; p.x = 7; p.y = 4; return p.x - p.y; }",
        );
        // Storage (8 bytes) plus the pointer slot (8 bytes) fills one
        // 16-byte frame.
        assert!(asm.contains("sub rsp, 16"));
        assert!(asm.contains("add rax, 0"));
        assert!(asm.contains("add rax, 4"));
    }

    #[test]
    fn test_local_class_constructor_and_method_call() {
        let asm = compile(
            "class C {\n\
                 var v : i32;\n\
                 C(n:i32) { this.v = n; }\n\
                 proc get() -> i32 { return this.v; }\n\
             }\n\
             proc main() -> i32 { var c : C(41); return c.get() + 1; }",
        );
        assert!(asm.contains("__C_init_:"));
        assert!(asm.contains("__C_proc_get:"));
        assert!(asm.contains("call __C_init_"));
        assert!(asm.contains("call __C_proc_get"));
        assert!(asm.contains("extrn malloc"));
    }

    #[test]
    fn test_new_allocates_through_malloc() {
        let asm = compile(
            "class C { var v : i64; C() { } }\n\
             proc main() -> i32 { var c : C = new C(); return 0; }",
        );
        assert!(asm.contains("mov rcx, 8"));
        assert!(asm.contains("call malloc"));
        assert!(asm.contains("call __C_init_"));
    }

    #[test]
    fn test_reserved_byte_array_in_data_section() {
        let asm = compile(
            "proc main() -> i32 { var s = res u8 [ 'H', 'i', 0 ]; return s[0]; }",
        );
        assert!(asm.contains("__array_0: db 72,105,0"));
        // u8 element loads zero-extended.
        assert!(asm.contains("movzx rax, al"));
    }

    #[test]
    fn test_string_literal_interned_with_nul() {
        let asm = compile("proc main() -> i32 { var s : u8* = \"Hi\"; return 0; }");
        assert!(asm.contains("__str_0: db 0x48,0x69,0x0"));
        assert!(asm.contains("mov rax, __str_0"));
    }

    #[test]
    fn test_uncalled_local_procedure_is_pruned() {
        let asm = compile(
            "local proc helper() -> i64 { return 1; }\n\
             proc main() -> i32 { return 0; }",
        );
        assert!(!asm.contains("helper:"));
    }

    #[test]
    fn test_uncalled_procedure_is_dropped_with_its_public_directive() {
        let asm = compile(
            "proc exported() -> i64 { return 1; }\n\
             proc main() -> i32 { return 0; }",
        );
        assert!(!asm.contains("exported:"));
        assert!(!asm.contains("public exported"));
    }

    #[test]
    fn test_uncalled_extern_directive_is_pruned() {
        let asm = compile(
            "external proc puts(s:u8*) -> i32;\n\
             proc main() -> i32 { return 0; }",
        );
        assert!(!asm.contains("extrn puts"));
        // The runtime allocator stays declared regardless.
        assert!(asm.contains("extrn malloc"));
        assert!(asm.contains("extrn free"));
    }

    #[test]
    fn test_called_extern_directive_is_kept() {
        let asm = compile(
            "external proc puts(s:u8*) -> i32;\n\
             proc main() -> i32 { puts(\"hi\"); return 0; }",
        );
        assert!(asm.contains("extrn puts"));
    }

    #[test]
    fn test_declared_but_never_defined_procedure_is_rejected() {
        let err = compile_err(
            "proc missing() -> i64;\n\
             proc main() -> i32 { return missing(); }",
        );
        assert!(err.contains("declared but never defined"));
    }

    #[test]
    fn test_forward_declaration_with_later_definition() {
        let asm = compile(
            "proc later() -> i64;\n\
             proc main() -> i32 { return later(); }\n\
             proc later() -> i64 { return 9; }",
        );
        assert!(asm.contains("later:"));
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let err = compile_err("proc main() -> i32 { break; return 0; }");
        assert!(err.contains("Cannot use break outside of loops"));
    }

    #[test]
    fn test_missing_return_is_rejected() {
        let err = compile_err("proc f() -> i64 { var x : i64; }");
        assert!(err.contains("Missing return statement"));
    }

    #[test]
    fn test_void_procedure_gets_synthesized_epilogue() {
        let asm = compile(
            "proc side() { var x : i64 = 1; }\n\
             proc main() -> i32 { side(); return 0; }",
        );
        assert!(asm.contains("side:"));
        assert!(asm.contains("mov rsp, rbp"));
    }

    #[test]
    fn test_undefined_variable_is_rejected() {
        let err = compile_err("proc main() -> i32 { return nope; }");
        assert!(err.contains("Undefined variable 'nope'"));
    }

    #[test]
    fn test_undefined_procedure_is_rejected() {
        let err = compile_err("proc main() -> i32 { return nope(); }");
        assert!(err.contains("undefined procedure 'nope'"));
    }

    #[test]
    fn test_argument_count_mismatch_is_rejected() {
        let err = compile_err(
            "proc f(a:i64) -> i64 { return a; }\n\
             proc main() -> i32 { return f(1, 2); }",
        );
        assert!(err.contains("Too many arguments"));
    }

    #[test]
    fn test_argument_type_mismatch_is_rejected() {
        let err = compile_err(
            "struct S { x : i64; }\n\
             proc f(a:S) -> i64 { return 0; }\n\
             proc main() -> i32 { return f(1); }",
        );
        assert!(err.contains("Passed wrong type of parameter"));
    }

    #[test]
    fn test_assignment_type_mismatch_is_rejected() {
        let err = compile_err(
            "struct S { x : i64; }\n\
             proc main() -> i32 { var s : S; s = 1; return 0; }",
        );
        assert!(err.contains("non matching types"));
    }

    #[test]
    fn test_numeric_widths_mix_silently() {
        // Numeric kinds of any width and signedness are interchangeable.
        let asm = compile("proc main() -> i32 { var a : u8 = 1; var b : i64 = a; return b; }");
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_pointer_base_types_mix_silently() {
        let asm = compile(
            "proc main() -> i32 { var a : u8* = \"x\"; var b : u64* = a; return 0; }",
        );
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_untyped_pointer_dereference_is_rejected() {
        let err = compile_err("proc main(p:ptr) -> i32 { return p[0]; }");
        assert!(err.contains("no base type"));
    }

    #[test]
    fn test_varargs_allows_extra_arguments() {
        let asm = compile(
            "external proc printf(fmt:u8*, ...) -> i32;\n\
             proc main() -> i32 { printf(\"%d %d\", 1, 2); return 0; }",
        );
        assert!(asm.contains("call printf"));
        assert!(asm.contains("add rsp, 32"));
    }

    #[test]
    fn test_short_circuit_and_or() {
        let asm = compile(
            "proc main() -> i32 { var a : i64 = 1; if (a and 0) { return 1; } if (a or 0) { return 2; } return 0; }",
        );
        assert!(asm.contains("setne al"));
        assert!(asm.contains("je .L"));
        assert!(asm.contains("jne .L"));
    }

    #[test]
    fn test_comparison_uses_direct_condition_codes() {
        let asm = compile(
            "proc main() -> i32 { var a : i64 = 1; var b : i64 = 2; if (a < b) { return 1; } if (a >= b) { return 2; } return 0; }",
        );
        assert!(asm.contains("setl al"));
        assert!(asm.contains("setge al"));
    }

    #[test]
    fn test_while_loop_with_break() {
        let asm = compile(
            "proc main() -> i32 { var i : i64 = 0; while (i < 10) { i = i + 1; if (i == 5) break; } return i; }",
        );
        assert!(asm.contains(".L0:"));
        assert!(asm.contains("jmp .L0"));
    }

    #[test]
    fn test_switch_compares_and_dispatches() {
        let asm = compile(
            "proc main() -> i32 { var x : i64 = 2; switch (x) { case 1: return 1; case 2: return 2; default: return 9; } return 0; }",
        );
        assert!(asm.contains("cmp rax, 1"));
        assert!(asm.contains("cmp rax, 2"));
        // Case checks jump to labeled blocks.
        assert!(asm.contains("je .L"));
    }

    #[test]
    fn test_switch_with_empty_default_jumps_to_end() {
        let asm = compile(
            "proc main() -> i32 { var x : i64 = 1; switch (x) { case 1: break; default: } return 0; }",
        );
        assert!(asm.contains("jmp .L0"));
    }

    #[test]
    fn test_enum_member_access_is_constant() {
        let asm = compile(
            "enum Color { RED, GREEN, BLUE }\n\
             proc main() -> i32 { return Color.BLUE; }",
        );
        assert!(asm.contains("mov rax, 2"));
    }

    #[test]
    fn test_inline_assembly_passthrough() {
        let asm = compile("proc main() -> i32 { asm \"cpuid\"; return 0; }");
        assert!(asm.contains("    cpuid"));
    }

    #[test]
    fn test_raw_stack_statements() {
        let asm = compile(
            "proc f(a:i64) -> i64 { return a; }\n\
             proc main() -> i32 { push 1; call f 1; pop; return 0; }",
        );
        assert!(asm.contains("call f"));
        assert!(asm.contains("add rsp, 8"));
    }

    #[test]
    fn test_register_expressions() {
        let asm = compile("proc main() -> i32 { %rax = 5; return %rax; }");
        assert!(asm.contains("pop rax"));
        assert!(asm.contains("push rax"));
    }

    #[test]
    fn test_global_variable_reservation_and_public() {
        let asm = compile("var counter : u64;\nproc main() -> i32 { counter = 1; return counter; }");
        assert!(asm.contains("counter: rq 1"));
        assert!(asm.contains("public counter"));
        assert!(asm.contains("mov qword [counter], rax"));
    }

    #[test]
    fn test_local_global_variable_has_no_public_directive() {
        let asm = compile("local var counter : u64;\nproc main() -> i32 { return counter; }");
        assert!(asm.contains("counter: rq 1"));
        assert!(!asm.contains("public counter"));
    }

    #[test]
    fn test_sizeof_type_and_expression() {
        let asm = compile(
            "struct S { a : u8; b : u32; c : u8; }\n\
             proc main() -> i32 { var s : S; return sizeof(S) + sizeof(s); }",
        );
        assert!(asm.contains("push 12"));
        assert!(asm.contains("push 8"));
    }

    #[test]
    fn test_signed_narrow_locals_sign_extend() {
        let asm = compile("proc main() -> i32 { var a : i16 = 1; return a; }");
        assert!(asm.contains("movsx rax, word [rbp - 2]"));
    }

    #[test]
    fn test_main_is_force_marked_called() {
        let asm = compile("local proc main() -> i32 { return 0; }");
        assert!(asm.contains("main:"));
    }
}
