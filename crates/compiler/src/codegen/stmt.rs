//! Statement and procedure emission.
//!
//! A procedure body opens with `push rbp ; mov rbp, rsp ; sub rsp, SIZE`
//! where `SIZE` is a placeholder. After the body is emitted the local
//! area is known; it is rounded up to a multiple of 16 and patched in,
//! or the placeholder is dropped when the frame is empty.

use super::{register_variant, Generator, LocalSlot, ScopeStack, ARGUMENT_REGISTERS};
use crate::ast::{Expr, ProcDecl, Stmt, Type};
use crate::error::{CompileError, SourceLocation};

impl Generator {
    pub(super) fn emit_procedure(&mut self, proc: &ProcDecl) -> Result<(), CompileError> {
        if !self.functions.contains_key(&proc.name) {
            self.index_procedure(proc);
        }

        let Some(body) = &proc.body else {
            // Forward declaration; a later definition supplies the body.
            return Ok(());
        };

        self.body = vec![
            "push rbp".to_string(),
            "mov rbp, rsp".to_string(),
            "sub rsp, SIZE".to_string(),
        ];
        self.current_function = proc.name.clone();
        self.scopes = ScopeStack::function_scope();
        self.local_offset = 0;
        self.max_align = 1;
        self.next_label = 0;

        if proc.name == "main" {
            if let Some(info) = self.functions.get_mut(&proc.name) {
                info.called = true;
            }
        }

        if !proc.is_local {
            self.push_directive(format!("public {}", proc.name));
        }

        // Spill register parameters into their local slots; parameters
        // past the fourth are read from the caller's stack above the
        // shadow space and return address.
        for (i, (arg_type, arg_name)) in proc.args.iter().enumerate() {
            self.emit_local_decl(arg_name, Some(arg_type), None, &proc.location)?;

            let size = arg_type.size();
            let width = arg_type.asm_width();
            let offset = self.local_offset;

            if i < ARGUMENT_REGISTERS.len() {
                self.emit(format!(
                    "mov {} [rbp - {}], {}",
                    width,
                    offset,
                    register_variant(ARGUMENT_REGISTERS[i], size)
                ));
            } else {
                self.emit(format!(
                    "mov {}, {} [rbp + {}]",
                    register_variant("rax", size),
                    width,
                    48 + (i - 4) * 8
                ));
                self.emit(format!(
                    "mov {} [rbp - {}], {}",
                    width,
                    offset,
                    register_variant("rax", size)
                ));
            }
        }

        for statement in body {
            self.emit_stmt(statement)?;
        }

        // Finalize the frame: round the local area up to the widest
        // alignment, then to a multiple of 16 for the ABI.
        let remainder = self.local_offset % self.max_align;
        if remainder != 0 {
            self.local_offset += self.max_align - remainder;
        }

        if self.local_offset > 0 {
            let frame = self.local_offset.div_ceil(16) * 16;
            self.body[2] = format!("sub rsp, {}", frame);
        } else {
            self.body.remove(2);
        }

        let ends_in_ret = self.body.last().is_some_and(|line| line == "ret");
        if proc.return_type == Type::Void {
            if !ends_in_ret {
                self.emit("mov rsp, rbp");
                self.emit("pop rbp");
                self.emit("ret");
            }
        } else if !ends_in_ret {
            return Err(CompileError::generate(
                format!("Missing return statement in procedure '{}'", proc.name),
                proc.location.clone(),
            ));
        }

        let finished = std::mem::take(&mut self.body);
        if let Some(info) = self.functions.get_mut(&proc.name) {
            info.body = Some(finished);
        }
        Ok(())
    }

    pub(super) fn emit_stmt(&mut self, statement: &Stmt) -> Result<(), CompileError> {
        match statement {
            Stmt::Local {
                name,
                ty,
                value,
                location,
            } => self.emit_local_decl(name, ty.as_ref(), value.as_ref(), location),

            Stmt::LocalArray {
                name,
                element,
                count,
                ..
            } => {
                let storage = element.size() * count;
                self.reserve_storage_with_pointer(name, storage, Type::pointer_to(element.clone()));
                Ok(())
            }

            Stmt::LocalStruct { name, ty, location } => {
                let aggregate = match ty {
                    Type::Struct(type_name) | Type::Class(type_name) => type_name,
                    _ => {
                        return Err(self.bug("local aggregate with a non aggregate type"));
                    }
                };
                let storage = self
                    .struct_layouts
                    .get(aggregate)
                    .ok_or_else(|| {
                        CompileError::generate(
                            format!("Unknown struct or class '{}'", aggregate),
                            location.clone(),
                        )
                    })?
                    .size;
                self.reserve_storage_with_pointer(name, storage, ty.clone());
                Ok(())
            }

            Stmt::Expression(expr) => {
                self.emit_expr(expr)?;
                // Drop the unused value's push. A register write already
                // nets zero stack effect, so there is nothing to drop.
                if !matches!(expr, Expr::SetRegister { .. }) {
                    self.body.pop();
                }
                Ok(())
            }

            Stmt::Return { value, location } => self.emit_return(value.as_ref(), location),

            Stmt::If {
                condition,
                body,
                else_body,
            } => self.emit_if(condition, body, else_body.as_deref()),

            Stmt::While { condition, body } => self.emit_while(condition, body),

            Stmt::Break { location } => {
                let Some(target) = self.break_stack.last() else {
                    return Err(CompileError::generate(
                        "Cannot use break outside of loops",
                        location.clone(),
                    ));
                };
                let target = target.clone();
                self.emit(format!("jmp {}", target));
                Ok(())
            }

            Stmt::Compound(body) => {
                self.scopes.push();
                let result = body.iter().try_for_each(|s| self.emit_stmt(s));
                self.scopes.pop();
                result
            }

            Stmt::Switch {
                value,
                cases,
                default_case,
            } => self.emit_switch(value, cases, default_case.as_deref()),

            Stmt::Push(value) => self.emit_expr(value),

            Stmt::Pop { name, location } => self.emit_pop(name.as_deref(), location),

            Stmt::RawCall {
                name,
                args_passed,
                location,
            } => self.emit_raw_call(name, *args_passed, location),

            Stmt::InlineAsm(text) => {
                self.emit(text.clone());
                Ok(())
            }

            Stmt::Multiple(parts) => parts.iter().try_for_each(|s| self.emit_stmt(s)),
        }
    }

    /// Declare a local variable. Sub-struct locals reserve their inline
    /// storage plus a pointer slot; scalars reserve one aligned slot.
    /// An initializer is type-checked against the declared type and
    /// stored with the slot's width.
    pub(super) fn emit_local_decl(
        &mut self,
        name: &str,
        ty: Option<&Type>,
        value: Option<&Expr>,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let declared = match ty {
            Some(ty @ Type::SubStruct { id, fields }) => {
                let layout = self.substruct_layout(*id, fields)?;
                let storage = layout.size;

                if value.is_none() {
                    self.reserve_storage_with_pointer(name, storage, ty.clone());
                    return Ok(());
                }

                // Initialized sub-struct locals still get the storage,
                // but the pointer slot is overwritten by the value.
                self.local_offset += storage + storage % 8;
                let slot_offset = self.reserve_slot(8);
                self.scopes.insert(
                    name,
                    LocalSlot {
                        size: 8,
                        ty: ty.clone(),
                        offset: slot_offset,
                    },
                );
                ty.clone()
            }
            Some(ty) => {
                let size = ty.size();
                let offset = self.reserve_slot(size);
                self.scopes.insert(
                    name,
                    LocalSlot {
                        size,
                        ty: ty.clone(),
                        offset,
                    },
                );
                ty.clone()
            }
            None => {
                // Auto-typed local: the initializer's type is the slot
                // type.
                let Some(value) = value else {
                    return Err(self.bug("auto typed local without an initializer"));
                };
                let resolved = self.resolve_type(value)?;
                let size = resolved.size();
                let offset = self.reserve_slot(size);
                self.scopes.insert(
                    name,
                    LocalSlot {
                        size,
                        ty: resolved.clone(),
                        offset,
                    },
                );

                self.emit_expr(value)?;
                self.emit("pop rax");
                self.emit(format!(
                    "mov {} [rbp - {}], {}",
                    resolved.asm_width(),
                    offset,
                    register_variant("rax", size)
                ));
                return Ok(());
            }
        };

        let Some(value) = value else {
            return Ok(());
        };

        let resolved = self.resolve_type(value)?;
        self.validate_assignment(&declared, &resolved, location, name)?;

        let offset = self.local_offset;
        self.emit_expr(value)?;
        self.emit("pop rax");
        self.emit(format!(
            "mov {} [rbp - {}], {}",
            declared.asm_width(),
            offset,
            register_variant("rax", declared.size())
        ));
        Ok(())
    }

    /// Reserve `storage` bytes of inline stack space plus an 8-byte slot
    /// holding a pointer to it; the named variable is the pointer.
    fn reserve_storage_with_pointer(&mut self, name: &str, storage: u64, ty: Type) {
        self.local_offset += storage + storage % 8;
        let storage_offset = self.local_offset;

        let slot_offset = self.reserve_slot(8);
        self.scopes.insert(
            name,
            LocalSlot {
                size: 8,
                ty,
                offset: slot_offset,
            },
        );

        self.emit(format!("lea rax, [rbp - {}]", storage_offset));
        self.emit(format!("mov qword [rbp - {}], rax", slot_offset));
    }

    fn emit_return(
        &mut self,
        value: Option<&Expr>,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let return_type = self
            .functions
            .get(&self.current_function)
            .ok_or_else(|| self.bug("return outside of a procedure"))?
            .return_type
            .clone();

        if return_type == Type::Void && value.is_some() {
            return Err(CompileError::generate(
                "Cannot return a value in a function that doesn't specify a return value",
                location.clone(),
            ));
        }

        if let Some(value) = value {
            self.emit_expr(value)?;
            self.emit("pop rax");
        }

        self.emit("mov rsp, rbp");
        self.emit("pop rbp");
        self.emit("ret");
        Ok(())
    }

    fn emit_if(
        &mut self,
        condition: &Expr,
        body: &Stmt,
        else_body: Option<&Stmt>,
    ) -> Result<(), CompileError> {
        self.emit_expr(condition)?;
        self.emit("pop rax");
        self.emit("cmp rax, 0");
        let skip_index = self.body.len();
        self.emit("je SOME_ADDRESS");

        self.emit_stmt(body)?;

        let else_jump_index = if else_body.is_some() {
            let index = self.body.len();
            self.emit("jmp SOME_ADDRESS");
            Some(index)
        } else {
            None
        };

        let end_label = self.next_label;
        self.next_label += 1;
        self.emit(format!(".L{}:", end_label));
        self.body[skip_index] = format!("je .L{}", end_label);

        if let Some(else_body) = else_body {
            self.emit_stmt(else_body)?;
            let done_label = self.next_label;
            self.next_label += 1;
            self.emit(format!(".L{}:", done_label));
            if let Some(index) = else_jump_index {
                self.body[index] = format!("jmp .L{}", done_label);
            }
        }

        Ok(())
    }

    fn emit_while(&mut self, condition: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let head_label = self.next_label;
        self.next_label += 1;
        self.emit(format!(".L{}:", head_label));

        self.emit_expr(condition)?;
        self.emit("pop rax");
        self.emit("cmp rax, 0");

        let end_label = self.next_label;
        self.next_label += 1;
        self.emit(format!("je .L{}", end_label));
        self.break_stack.push(format!(".L{}", end_label));

        let result = self.emit_stmt(body);
        self.emit(format!("jmp .L{}", head_label));
        self.emit(format!(".L{}:", end_label));
        self.break_stack.pop();
        result
    }

    fn emit_switch(
        &mut self,
        value: &Expr,
        cases: &[(i64, Vec<Stmt>)],
        default_case: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        let end_label = format!(".L{}", self.next_label);
        self.next_label += 1;
        self.break_stack.push(end_label.clone());

        let default_case = default_case.filter(|body| !body.is_empty());
        let default_label = default_case.map(|_| {
            let label = format!(".L{}", self.next_label);
            self.next_label += 1;
            label
        });

        let result = (|| {
            self.emit_expr(value)?;
            self.emit("pop rax");

            let mut case_labels = Vec::new();
            for (constant, _) in cases {
                let label = self.next_label;
                self.next_label += 1;
                case_labels.push(label);
                self.emit(format!("cmp rax, {}", constant));
                self.emit(format!("je .L{}", label));
            }

            match &default_label {
                Some(label) => self.emit(format!("jmp {}", label)),
                None => self.emit(format!("jmp {}", end_label)),
            }

            // Case bodies in declaration order; control reaches the next
            // case only by omitting `break`.
            for (label, (_, body)) in case_labels.iter().zip(cases) {
                self.emit(format!(".L{}:", label));
                for statement in body {
                    self.emit_stmt(statement)?;
                }
            }

            if let (Some(body), Some(label)) = (default_case, &default_label) {
                self.emit(format!("{}:", label));
                for statement in body {
                    self.emit_stmt(statement)?;
                }
            }

            self.emit(format!("{}:", end_label));
            Ok(())
        })();

        self.break_stack.pop();
        result
    }

    fn emit_pop(
        &mut self,
        name: Option<&str>,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let Some(name) = name else {
            self.emit("add rsp, 8");
            return Ok(());
        };

        if let Some(slot) = self.scopes.get(name) {
            let (offset, ty, size) = (slot.offset, slot.ty.clone(), slot.size);
            self.emit("pop rax");
            self.emit(format!(
                "mov {} [rbp - {}], {}",
                ty.asm_width(),
                offset,
                register_variant("rax", size)
            ));
        } else if let Some(ty) = self.globals.get(name).cloned() {
            self.emit("pop rax");
            self.emit(format!(
                "mov {} [{}], {}",
                ty.asm_width(),
                name,
                register_variant("rax", ty.size())
            ));
        } else {
            return Err(CompileError::generate(
                format!("Undefined variable '{}'", name),
                location.clone(),
            ));
        }
        Ok(())
    }

    /// `call name [n];` — the raw form: arguments are whatever the
    /// surrounding `push` statements left on the stack.
    fn emit_raw_call(
        &mut self,
        name: &str,
        args_passed: usize,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        let Some(info) = self.functions.get_mut(name) else {
            return Err(CompileError::generate(
                format!("Tried calling an undefined procedure '{}'", name),
                location.clone(),
            ));
        };
        info.called = true;
        let count = if args_passed == 0 {
            info.args.len()
        } else {
            args_passed
        };

        for register in ARGUMENT_REGISTERS.iter().take(count) {
            self.emit(format!("pop {}", register));
        }

        self.emit("sub rsp, 32");
        self.emit(format!("call {}", name));
        self.emit(format!("add rsp, {}", 32 + count.saturating_sub(4) * 8));
        self.emit("push rax");
        Ok(())
    }
}
