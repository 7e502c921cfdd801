//! Expression emission.
//!
//! Every expression ends by pushing its 64-bit value. Loads narrower
//! than 64 bits extend according to the source type: signed 8/16-bit
//! values sign-extend, unsigned ones zero-extend, and 32-bit loads rely
//! on the implicit zero-extension of writing `eax`.

use super::resolve::pointer_base;
use super::{register_variant, Generator, ARGUMENT_REGISTERS};
use crate::ast::{Expr, Type};
use crate::error::{CompileError, SourceLocation};
use crate::scanner::TokenKind;

impl Generator {
    pub(super) fn emit_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(value) => {
                if *value == 0 {
                    self.emit("xor rax, rax");
                } else {
                    self.emit(format!("mov rax, {}", value));
                }
                self.emit("push rax");
                Ok(())
            }

            Expr::Str { value, .. } => {
                let symbol = self.intern_string(value);
                self.emit(format!("mov rax, {}", symbol));
                self.emit("push rax");
                Ok(())
            }

            Expr::Variable { name, location } => self.emit_variable_read(name, location),

            Expr::Assign {
                name,
                value,
                location,
            } => self.emit_assign(name, value, location),

            Expr::Binary { op, left, right } => self.emit_binary(*op, left, right),

            Expr::Call {
                name,
                args,
                location,
            } => self.emit_call(name, args, location),

            Expr::CallExpression {
                target,
                args,
                location,
            } => self.emit_method_call(target, args, location),

            // A cast changes only the statically resolved type.
            Expr::Cast { value, .. } => self.emit_expr(value),

            Expr::AddressOf { name, location } => {
                if let Some(slot) = self.scopes.get(name) {
                    let offset = slot.offset;
                    self.emit(format!("lea rax, [rbp - {}]", offset));
                } else if self.globals.contains_key(name) {
                    self.emit(format!("mov rax, {}", name));
                } else {
                    return Err(CompileError::generate(
                        format!("Undefined variable '{}'", name),
                        location.clone(),
                    ));
                }
                self.emit("push rax");
                Ok(())
            }

            Expr::Deref {
                pointer,
                offset,
                location,
            } => self.emit_deref(pointer, offset, location),

            Expr::StoreAt {
                pointer,
                offset,
                value,
                location,
            } => self.emit_store_at(pointer, offset, value, location),

            Expr::ReserveUninit { ty, count, .. } => {
                let symbol = self.reserve_bss(ty, *count);
                self.emit(format!("mov rax, {}", symbol));
                self.emit("push rax");
                Ok(())
            }

            Expr::ReserveInit {
                ty,
                values,
                location,
            } => {
                let symbol = self.reserve_init_symbol(ty, values, location)?;
                self.emit(format!("mov rax, {}", symbol));
                self.emit("push rax");
                Ok(())
            }

            Expr::Field {
                object,
                name,
                location,
            } => self.emit_field_read(object, name, location),

            Expr::SetField {
                object,
                name,
                value,
                location,
            } => self.emit_field_write(object, name, value, location),

            Expr::Sizeof(value) => {
                let ty = self.resolve_type(value)?;
                self.emit(format!("push {}", ty.size()));
                Ok(())
            }

            Expr::SizeofType(ty) => self.emit_sizeof_type(ty),

            Expr::Not(value) => {
                self.emit_expr(value)?;
                self.emit("pop rax");
                self.emit("cmp rax, 0");
                self.emit("sete al");
                self.emit("movzx rax, al");
                self.emit("push rax");
                Ok(())
            }

            Expr::New {
                class,
                args,
                location,
            } => self.emit_new(class, args, location),

            Expr::Register(name) => {
                self.emit(format!("push {}", name));
                Ok(())
            }

            Expr::SetRegister { name, value } => {
                self.emit_expr(value)?;
                self.emit(format!("pop {}", name));
                Ok(())
            }
        }
    }

    /// Load `[addr]` into `rax` with the extension rules for `ty`.
    pub(super) fn emit_load(&mut self, addr: &str, ty: &Type) {
        let size = ty.size();

        if ty.is_signed_narrow() {
            self.emit(format!("movsx rax, {} [{}]", ty.asm_width(), addr));
        } else if size == 4 {
            self.emit(format!("mov eax, dword [{}]", addr));
        } else if size != 8 {
            self.emit(format!("mov rax, [{}]", addr));
            self.emit(format!("movzx rax, {}", register_variant("rax", size)));
        } else {
            self.emit(format!("mov rax, [{}]", addr));
        }
    }

    fn emit_variable_read(
        &mut self,
        name: &str,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        if let Some(slot) = self.scopes.get(name) {
            let (offset, ty) = (slot.offset, slot.ty.clone());
            self.emit_load(&format!("rbp - {}", offset), &ty);
        } else if let Some(ty) = self.globals.get(name).cloned() {
            self.emit_load(name, &ty);
        } else {
            return Err(CompileError::generate(
                format!("Undefined variable '{}'", name),
                location.clone(),
            ));
        }

        self.emit("push rax");
        Ok(())
    }

    fn emit_assign(
        &mut self,
        name: &str,
        value: &Expr,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let resolved = self.resolve_type(value)?;

        if let Some(slot) = self.scopes.get(name) {
            let (offset, ty, size) = (slot.offset, slot.ty.clone(), slot.size);
            self.validate_assignment(&ty, &resolved, location, name)?;

            self.emit_expr(value)?;
            self.emit("pop rax");
            self.emit(format!(
                "mov {} [rbp - {}], {}",
                ty.asm_width(),
                offset,
                register_variant("rax", size)
            ));
            self.emit("push rax");
        } else if let Some(ty) = self.globals.get(name).cloned() {
            self.validate_assignment(&ty, &resolved, location, name)?;

            self.emit_expr(value)?;
            self.emit("pop rax");
            self.emit(format!(
                "mov {} [{}], {}",
                ty.asm_width(),
                name,
                register_variant("rax", ty.size())
            ));
            self.emit("push rax");
        } else {
            return Err(CompileError::generate(
                format!("Attempted assigning to an undefined variable '{}'", name),
                location.clone(),
            ));
        }

        Ok(())
    }

    fn emit_binary(
        &mut self,
        op: TokenKind,
        left: &Expr,
        right: &Expr,
    ) -> Result<(), CompileError> {
        // `and` / `or` short-circuit through a fresh label pair and push
        // a 0/1 result.
        if op == TokenKind::And || op == TokenKind::Or {
            self.emit_expr(left)?;

            let short_label = self.next_label;
            self.next_label += 1;

            self.emit("pop rax");
            self.emit("cmp rax, 0");
            if op == TokenKind::And {
                self.emit(format!("je .L{}", short_label));
            } else {
                self.emit(format!("jne .L{}", short_label));
            }

            self.emit_expr(right)?;

            let end_label = self.next_label;
            self.emit("pop rax");
            self.emit("cmp rax, 0");
            self.emit("setne al");
            self.emit("movzx rax, al");
            self.emit("push rax");
            self.emit(format!("jmp .L{}", end_label));
            self.emit(format!(".L{}:", short_label));
            self.emit(if op == TokenKind::And {
                "mov rax, 0"
            } else {
                "mov rax, 1"
            });
            self.emit("push rax");
            self.emit(format!(".L{}:", end_label));
            self.next_label += 1;
            return Ok(());
        }

        self.emit_expr(right)?;
        self.emit_expr(left)?;

        let lines: &[&str] = match op {
            TokenKind::Plus => &["pop rax", "pop rbx", "add rax, rbx", "push rax"],
            TokenKind::Minus => &["pop rax", "pop rbx", "sub rax, rbx", "push rax"],
            TokenKind::Star => &["pop rax", "pop rbx", "mul rbx", "push rax"],
            TokenKind::Slash => &["xor rdx, rdx", "pop rax", "pop rbx", "div rbx", "push rax"],
            TokenKind::Percent => &["xor rdx, rdx", "pop rax", "pop rbx", "div rbx", "push rdx"],
            TokenKind::EqEq => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "sete al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::NotEq => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "setne al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::Greater => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "setg al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::Less => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "setl al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::GreaterEq => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "setge al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::LessEq => &[
                "pop rax",
                "pop rbx",
                "cmp rax, rbx",
                "setle al",
                "movzx rax, al",
                "push rax",
            ],
            TokenKind::Caret => &["pop rax", "pop rbx", "xor rax, rbx", "push rax"],
            TokenKind::Pipe => &["pop rax", "pop rbx", "or rax, rbx", "push rax"],
            TokenKind::Ampersand => &["pop rax", "pop rbx", "and rax, rbx", "push rax"],
            other => {
                return Err(self.bug(format!("no emission for binary operator {:?}", other)));
            }
        };

        for line in lines {
            self.emit(*line);
        }
        Ok(())
    }

    fn emit_call(
        &mut self,
        name: &str,
        args: &[Expr],
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let Some(info) = self.functions.get_mut(name) else {
            return Err(CompileError::generate(
                format!("Tried calling an undefined procedure '{}'", name),
                location.clone(),
            ));
        };
        info.called = true;
        let callee_args = info.args.clone();
        let varargs = info.varargs;
        let stdcall = info.stdcall;

        if args.len() < callee_args.len() {
            return Err(CompileError::generate(
                format!("Too few arguments passed to procedure '{}'", name),
                location.clone(),
            ));
        }
        if args.len() > callee_args.len() && !varargs {
            return Err(CompileError::generate(
                format!("Too many arguments passed to procedure '{}'", name),
                location.clone(),
            ));
        }

        for (i, (arg, (expected, _))) in args.iter().zip(&callee_args).enumerate() {
            let resolved = self.resolve_type(arg)?;
            self.validate_argument(expected, &resolved, name, i + 1, location)?;
        }

        for arg in args.iter().rev() {
            self.emit_expr(arg)?;
        }

        for register in ARGUMENT_REGISTERS.iter().take(args.len()) {
            self.emit(format!("pop {}", register));
        }

        self.emit("sub rsp, 32");
        self.emit(format!("call {}", name));
        if !stdcall {
            self.emit(format!(
                "add rsp, {}",
                32 + args.len().saturating_sub(4) * 8
            ));
        }
        self.emit("push rax");
        Ok(())
    }

    fn emit_method_call(
        &mut self,
        target: &Expr,
        args: &[Expr],
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let (class_name, mangled, method) = self.resolve_method(target, location)?;
        let Expr::Field {
            object,
            name: method_name,
            ..
        } = target
        else {
            return Err(self.bug("method target lost its field access"));
        };

        if let Some(info) = self.functions.get_mut(&mangled) {
            info.called = true;
        }

        // The receiver is the implicit first argument.
        let caller_len = 1 + args.len();
        let callee_len = method.args.len();

        if caller_len < callee_len {
            return Err(CompileError::generate(
                format!(
                    "Too few arguments passed to method '{}' for class '{}'",
                    method_name, class_name
                ),
                location.clone(),
            ));
        }
        if caller_len > callee_len && !method.varargs {
            return Err(CompileError::generate(
                format!(
                    "Too many arguments passed to method '{}' for class '{}'",
                    method_name, class_name
                ),
                location.clone(),
            ));
        }

        let caller_args: Vec<&Expr> =
            std::iter::once(&**object).chain(args.iter()).collect();
        for (i, (arg, (expected, _))) in caller_args.iter().zip(&method.args).enumerate() {
            let resolved = self.resolve_type(arg)?;
            self.validate_argument(expected, &resolved, method_name, i + 1, location)?;
        }

        for arg in caller_args.iter().rev() {
            self.emit_expr(arg)?;
        }

        for register in ARGUMENT_REGISTERS.iter().take(caller_len) {
            self.emit(format!("pop {}", register));
        }

        self.emit("sub rsp, 32");
        self.emit(format!("call {}", mangled));
        self.emit(format!(
            "add rsp, {}",
            32 + caller_len.saturating_sub(4) * 8
        ));
        self.emit("push rax");
        Ok(())
    }

    /// `new C(args)`: allocate `sizeof(C)` through `malloc`, stash the
    /// pointer in an anonymous local slot, run the initializer with it
    /// as `this`, and push the pointer.
    fn emit_new(
        &mut self,
        class_name: &str,
        args: &[Expr],
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let Some(class) = self.classes.get(class_name) else {
            return Err(CompileError::generate(
                format!("Unknown class '{}'", class_name),
                location.clone(),
            ));
        };
        let Some(init) = class.initializer.clone() else {
            return Err(CompileError::generate(
                format!("Class '{}' has no initializer", class_name),
                location.clone(),
            ));
        };
        let class_size = self
            .struct_layouts
            .get(class_name)
            .ok_or_else(|| self.bug(format!("no layout registered for '{}'", class_name)))?
            .size;

        let temp_offset = self.reserve_slot(8);

        self.emit(format!("mov rcx, {}", class_size));
        self.emit("sub rsp, 32");
        self.emit("call malloc");
        self.emit("add rsp, 32");
        self.emit(format!("mov qword [rbp - {}], rax", temp_offset));

        let callee_args = &init.args[1..];
        if args.len() < callee_args.len() {
            return Err(CompileError::generate(
                format!(
                    "Too few arguments passed to initializer for class '{}'",
                    class_name
                ),
                location.clone(),
            ));
        }
        if args.len() > callee_args.len() && !init.varargs {
            return Err(CompileError::generate(
                format!(
                    "Too many arguments passed to initializer for class '{}'",
                    class_name
                ),
                location.clone(),
            ));
        }

        let callee_args = callee_args.to_vec();
        for (i, (arg, (expected, _))) in args.iter().zip(&callee_args).enumerate() {
            let resolved = self.resolve_type(arg)?;
            self.validate_argument(expected, &resolved, "initializer", i + 1, location)?;
        }

        for arg in args.iter().rev() {
            self.emit_expr(arg)?;
        }

        self.emit(format!("mov rcx, qword [rbp - {}]", temp_offset));
        for register in ARGUMENT_REGISTERS.iter().skip(1).take(args.len()) {
            self.emit(format!("pop {}", register));
        }

        self.emit("sub rsp, 32");
        self.emit(format!("call __{}_init_", class_name));
        self.emit(format!(
            "add rsp, {}",
            32 + args.len().saturating_sub(4) * 8
        ));

        self.emit(format!("mov rax, qword [rbp - {}]", temp_offset));
        self.emit("push rax");
        Ok(())
    }

    /// Compute `pointer + offset * sizeof(base)` into `rax`, consuming
    /// the two pushed operands.
    fn emit_address_calc(&mut self, element_size: u64) {
        self.emit("pop rbx");
        self.emit(format!("mov rax, {}", element_size));
        self.emit("mul rbx");
        self.emit("mov rbx, rax");
        self.emit("pop rax");
        self.emit("add rax, rbx");
    }

    fn emit_deref(
        &mut self,
        pointer: &Expr,
        offset: &Expr,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        self.emit_expr(pointer)?;
        self.emit_expr(offset)?;

        let pointer_type = self.resolve_type(pointer)?;
        if !matches!(pointer_type, Type::Ptr(_)) {
            return Err(CompileError::generate(
                "Tried dereferencing a non pointer type",
                location.clone(),
            ));
        }
        let Some(base) = pointer_base(&pointer_type) else {
            return Err(CompileError::generate(
                "Tried dereferencing a pointer with no base type",
                location.clone(),
            ));
        };

        self.emit_address_calc(base.size());
        self.emit_load("rax", &base);
        self.emit("push rax");
        Ok(())
    }

    fn emit_store_at(
        &mut self,
        pointer: &Expr,
        offset: &Expr,
        value: &Expr,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        self.emit_expr(value)?;
        self.emit_expr(pointer)?;
        self.emit_expr(offset)?;

        let pointer_type = self.resolve_type(pointer)?;
        if !matches!(pointer_type, Type::Ptr(_)) {
            return Err(CompileError::generate(
                "Tried assigning at a non pointer type",
                location.clone(),
            ));
        }
        let Some(base) = pointer_base(&pointer_type) else {
            return Err(CompileError::generate(
                "Tried assigning at a pointer with no base type",
                location.clone(),
            ));
        };

        self.emit_address_calc(base.size());
        self.emit("pop rbx");
        self.emit(format!(
            "mov {} [rax], {}",
            base.asm_width(),
            register_variant("rbx", base.size())
        ));
        self.emit("push rbx");
        Ok(())
    }

    fn emit_field_read(
        &mut self,
        object: &Expr,
        field: &str,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        // `Enum.MEMBER` resolves statically to its constant.
        if let Some(value) = self.enum_constant(object, field, location)? {
            self.emit(format!("mov rax, {}", value));
            self.emit("push rax");
            return Ok(());
        }

        self.emit_expr(object)?;
        let object_type = self.resolve_type(object)?;
        let info = self.field_info(&object_type, field, location)?;

        self.emit("pop rax");
        self.emit(format!("add rax, {}", info.offset));

        // Sub-struct and array fields yield their address, allowing
        // chained access and address taking.
        if matches!(info.ty, Type::SubStruct { .. } | Type::Array { .. }) {
            self.emit("push rax");
            return Ok(());
        }

        self.emit_load("rax", &info.ty);
        self.emit("push rax");
        Ok(())
    }

    fn emit_field_write(
        &mut self,
        object: &Expr,
        field: &str,
        value: &Expr,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        self.emit_expr(object)?;
        let object_type = self.resolve_type(object)?;
        let info = self.field_info(&object_type, field, location)?;

        self.emit_expr(value)?;

        if matches!(info.ty, Type::SubStruct { .. }) {
            return Err(CompileError::generate(
                "Attempted assigning to a sub struct",
                location.clone(),
            ));
        }

        self.emit("pop rbx");
        self.emit("pop rax");
        self.emit(format!("add rax, {}", info.offset));
        self.emit(format!(
            "mov {} [rax], {}",
            info.ty.asm_width(),
            register_variant("rbx", info.size)
        ));
        self.emit("push rax");
        Ok(())
    }

    fn emit_sizeof_type(&mut self, ty: &Type) -> Result<(), CompileError> {
        let size = match ty {
            Type::Struct(name) | Type::Class(name) => {
                self.struct_layouts
                    .get(name)
                    .ok_or_else(|| self.bug(format!("no layout registered for '{}'", name)))?
                    .size
            }
            Type::SubStruct { id, fields } => self.substruct_layout(*id, fields)?.size,
            _ => ty.size(),
        };
        self.emit(format!("push {}", size));
        Ok(())
    }

    /// Materialize a `res TYPE [ … ]` initializer into `.data`,
    /// interning nested strings and reservations first, and return the
    /// array's symbol.
    fn reserve_init_symbol(
        &mut self,
        ty: &Type,
        values: &[Expr],
        location: &SourceLocation,
    ) -> Result<String, CompileError> {
        let mut parts = Vec::new();

        for value in values {
            match value {
                Expr::Number(n) => parts.push(n.to_string()),
                Expr::Str {
                    value: raw,
                    location: value_location,
                } => {
                    self.check_reserve_width(ty, value_location, "string (u8*, u64, ptr)")?;
                    parts.push(self.intern_string(raw));
                }
                Expr::ReserveUninit {
                    ty: element_type,
                    count,
                    location: value_location,
                } => {
                    self.check_reserve_width(ty, value_location, "reserved array (u64, ptr)")?;
                    parts.push(self.reserve_bss(element_type, *count));
                }
                Expr::ReserveInit {
                    ty: element_type,
                    values: nested,
                    location: value_location,
                } => {
                    self.check_reserve_width(ty, value_location, "reserved array (u64, ptr)")?;
                    let symbol = self.reserve_init_symbol(element_type, nested, value_location)?;
                    parts.push(symbol);
                }
                _ => {
                    return Err(CompileError::generate(
                        "Reserved array value must be a constant value",
                        location.clone(),
                    ));
                }
            }
        }

        Ok(self.reserve_data(ty, parts.join(",")))
    }

    fn check_reserve_width(
        &self,
        ty: &Type,
        location: &SourceLocation,
        what: &str,
    ) -> Result<(), CompileError> {
        if matches!(ty, Type::Ptr(_) | Type::U64) {
            return Ok(());
        }
        Err(CompileError::generate(
            format!("Reserved array type is not big enough to hold a {}", what),
            location.clone(),
        ))
    }
}
