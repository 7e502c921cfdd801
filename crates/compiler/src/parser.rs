//! Recursive-descent parser over the expanded token stream.
//!
//! Produces [`Decl`] / [`Stmt`] / [`Expr`] nodes and records type
//! declarations (structs, classes, enums) as it goes so later
//! declarations can reference them. Class methods and initializers are
//! desugared here into global procedures with mangled names
//! (`__CLASS_proc_METHOD`, `__CLASS_init_`) that take an implicit
//! leading `this` parameter.
//!
//! The only folding performed is collapsing binary operations whose two
//! operands are integer literals.

use crate::ast::{ClassDecl, Decl, Expr, Field, MethodSig, ProcDecl, Stmt, Type};
use crate::error::{CompileError, SourceLocation};
use crate::scanner::{Token, TokenKind};
use std::collections::HashMap;

/// A named type recorded while parsing, with enough bookkeeping to
/// diagnose forward declarations that were never defined.
#[derive(Debug, Clone)]
struct TypeDef {
    ty: Type,
    declared: bool,
    location: SourceLocation,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    typedefs: HashMap<String, TypeDef>,
    enums: HashMap<String, HashMap<String, i64>>,
    next_substruct_id: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            typedefs: HashMap::new(),
            enums: HashMap::new(),
            next_substruct_id: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Decl>, CompileError> {
        let mut declarations = Vec::new();

        while self.available() {
            self.parse_declaration(&mut declarations)?;
        }

        for (name, def) in &self.typedefs {
            if matches!(def.ty, Type::Struct(_) | Type::Class(_)) && !def.declared {
                return Err(self.error_at(
                    def.location.clone(),
                    format!("Body of '{}' was never defined, only forward declared", name),
                ));
            }
        }

        Ok(declarations)
    }

    fn parse_declaration(&mut self, out: &mut Vec<Decl>) -> Result<(), CompileError> {
        let is_local = self.matches(TokenKind::Local);

        if self.matches(TokenKind::Var) {
            let name = self.consume(TokenKind::Identifier, "Expected variable name")?;
            self.consume(TokenKind::Colon, "Expected variable type")?;
            let ty = self.consume_type("Expected variable type")?;
            self.consume(
                TokenKind::Semicolon,
                "Expected ';' after global variable declaration",
            )?;

            out.push(Decl::Variable {
                name: name.lexeme,
                ty,
                is_local,
                location: name.location,
            });
            return Ok(());
        }

        if self.matches(TokenKind::Proc) {
            let stdcall = self.matches(TokenKind::Stdcall);
            let name = self.consume(TokenKind::Identifier, "Expected procedure name")?;
            let (args, varargs) = self.parse_parameter_list(Vec::new())?;

            let return_type = if self.matches(TokenKind::Arrow) {
                self.consume_type("Expected procedure return type after '->'")?
            } else {
                Type::Void
            };

            let body = if self.matches(TokenKind::Semicolon) {
                None
            } else {
                self.consume(TokenKind::OpenBrace, "Expected '{' for procedure body")?;
                Some(self.parse_block()?)
            };

            out.push(Decl::Procedure(ProcDecl {
                name: name.lexeme,
                return_type,
                body,
                args,
                location: name.location,
                varargs,
                stdcall,
                is_local,
                always_emit: false,
            }));
            return Ok(());
        }

        if self.matches(TokenKind::External) {
            if self.matches(TokenKind::Proc) {
                let stdcall = self.matches(TokenKind::Stdcall);
                let name = self.consume(TokenKind::Identifier, "Expected procedure name")?;
                let (args, varargs) = self.parse_parameter_list(Vec::new())?;

                let return_type = if self.matches(TokenKind::Arrow) {
                    self.consume_type("Expected procedure return type after '->'")?
                } else {
                    Type::Void
                };
                self.consume(TokenKind::Semicolon, "Expected ';' after extern procedure")?;

                out.push(Decl::ExternProcedure {
                    name: name.lexeme,
                    return_type,
                    args,
                    varargs,
                    stdcall,
                    location: name.location,
                });
                return Ok(());
            }

            if self.matches(TokenKind::Var) {
                let name = self.consume(TokenKind::Identifier, "Expected variable name")?;
                self.consume(TokenKind::Colon, "Expected variable type")?;
                let ty = self.consume_type("Expected variable type")?;
                self.consume(
                    TokenKind::Semicolon,
                    "Expected ';' after extern variable declaration",
                )?;

                out.push(Decl::ExternVariable {
                    name: name.lexeme,
                    ty,
                    location: name.location,
                });
                return Ok(());
            }

            return Err(self.error_here("Expected 'proc' or 'var' after 'external'"));
        }

        if self.matches(TokenKind::Struct) {
            let name = self.consume(TokenKind::Identifier, "Expected struct name")?;

            if self.matches(TokenKind::Semicolon) {
                self.declare_type(&name, Type::Struct(name.lexeme.clone()), false);
                return Ok(());
            }

            let members = self.parse_struct_fields()?;
            self.declare_type(&name, Type::Struct(name.lexeme.clone()), true);
            out.push(Decl::Struct {
                name: name.lexeme,
                members,
                location: name.location,
            });
            return Ok(());
        }

        if self.matches(TokenKind::Enum) {
            let name = self.consume(TokenKind::Identifier, "Expected enum name")?;
            self.consume(TokenKind::OpenBrace, "Expected '{'")?;

            let mut values = Vec::new();
            let mut next = 0i64;

            if !self.check(TokenKind::CloseBrace) {
                loop {
                    let value_name =
                        self.consume(TokenKind::Identifier, "Expected enumeration value name")?;

                    if self.matches(TokenKind::Equals) {
                        let number =
                            self.consume(TokenKind::Number, "Expected number after '=' in enum")?;
                        next = self.parse_integer(&number)?;
                    }

                    values.push((value_name.lexeme, next));
                    next += 1;

                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }

            self.consume(TokenKind::CloseBrace, "Expected '}'")?;
            self.declare_type(&name, Type::U64, true);
            self.enums
                .insert(name.lexeme.clone(), values.iter().cloned().collect());
            out.push(Decl::Enum {
                name: name.lexeme,
                values,
            });
            return Ok(());
        }

        if self.matches(TokenKind::Class) {
            return self.parse_class(out);
        }

        if !self.matches(TokenKind::Eof) {
            return Err(self.error_here("Expected declaration"));
        }

        Ok(())
    }

    fn parse_class(&mut self, out: &mut Vec<Decl>) -> Result<(), CompileError> {
        let name = self.consume(TokenKind::Identifier, "Expected class name")?;
        let class_name = name.lexeme.clone();

        if self.matches(TokenKind::Semicolon) {
            self.declare_type(&name, Type::Class(class_name), false);
            return Ok(());
        }

        self.consume(TokenKind::OpenBrace, "Expected '{'")?;

        let mut members = Vec::new();
        let mut methods = Vec::new();
        let mut procedures = Vec::new();
        let mut initializer = None;
        let this_param = || (Type::Class(name.lexeme.clone()), "this".to_string());

        while !self.check(TokenKind::CloseBrace) {
            if self.matches(TokenKind::Var) {
                let field_name = self.consume(TokenKind::Identifier, "Expected field name")?;
                self.consume(TokenKind::Colon, "Expected field type")?;
                let mut field_type = self.consume_type("Expected field type")?;

                if self.matches(TokenKind::OpenSquare) {
                    let count = self.consume(TokenKind::Number, "Expected array size")?;
                    self.consume(TokenKind::CloseSquare, "Expected ']' after array size")?;
                    field_type = Type::Array {
                        element: Box::new(field_type),
                        count: self.parse_count(&count)?,
                    };
                }

                self.consume(TokenKind::Semicolon, "Expected ';' after field")?;
                members.push((field_type, field_name.lexeme));
            } else if self.matches(TokenKind::Proc) {
                let method_name = self.consume(TokenKind::Identifier, "Expected method name")?;
                let (args, varargs) = self.parse_parameter_list(vec![this_param()])?;

                let return_type = if self.matches(TokenKind::Arrow) {
                    self.consume_type("Expected method return type after '->'")?
                } else {
                    Type::Void
                };

                let body = if self.matches(TokenKind::Semicolon) {
                    None
                } else {
                    self.consume(TokenKind::OpenBrace, "Expected '{' for method body")?;
                    Some(self.parse_block()?)
                };

                methods.push((
                    method_name.lexeme.clone(),
                    MethodSig {
                        args: args.clone(),
                        varargs,
                        return_type: return_type.clone(),
                    },
                ));
                procedures.push(ProcDecl {
                    name: format!("__{}_proc_{}", name.lexeme, method_name.lexeme),
                    return_type,
                    body,
                    args,
                    location: method_name.location,
                    varargs,
                    stdcall: false,
                    is_local: true,
                    always_emit: false,
                });
            } else if self.check(TokenKind::Identifier) && self.peek().lexeme == name.lexeme {
                let init_token = self.advance();
                let (args, varargs) = self.parse_parameter_list(vec![this_param()])?;

                self.consume(TokenKind::OpenBrace, "Expected '{' for initializer body")?;
                let body = self.parse_block()?;

                initializer = Some(MethodSig {
                    args: args.clone(),
                    varargs,
                    return_type: Type::Void,
                });
                procedures.push(ProcDecl {
                    name: format!("__{}_init_", name.lexeme),
                    return_type: Type::Void,
                    body: Some(body),
                    args,
                    location: init_token.location,
                    varargs,
                    stdcall: false,
                    is_local: true,
                    always_emit: true,
                });
            } else {
                return Err(self.error_here("Expected class member, function or initializer"));
            }
        }

        self.consume(TokenKind::CloseBrace, "Expected '}'")?;
        self.declare_type(&name, Type::Class(name.lexeme.clone()), true);

        out.push(Decl::Class(ClassDecl {
            name: name.lexeme,
            members,
            methods,
            initializer,
            location: name.location,
        }));
        out.extend(procedures.into_iter().map(Decl::Procedure));
        Ok(())
    }

    /// Parse an optional parenthesized parameter list, seeded with any
    /// implicit parameters (`this` for class members).
    fn parse_parameter_list(
        &mut self,
        seed: Vec<Field>,
    ) -> Result<(Vec<Field>, bool), CompileError> {
        let mut args = seed;
        let mut varargs = false;

        if self.matches(TokenKind::OpenParen) {
            if !self.check(TokenKind::CloseParen) {
                loop {
                    if self.matches(TokenKind::Varargs) {
                        varargs = true;
                        break;
                    }

                    let arg_name =
                        self.consume(TokenKind::Identifier, "Expected procedure parameter name")?;
                    self.consume(TokenKind::Colon, "Expected procedure parameter type")?;
                    let arg_type = self.consume_type("Expected procedure parameter type")?;
                    args.push((arg_type, arg_name.lexeme));

                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }

            self.consume(
                TokenKind::CloseParen,
                "Expected ')' after procedure parameters",
            )?;
        }

        Ok((args, varargs))
    }

    fn parse_struct_fields(&mut self) -> Result<Vec<Field>, CompileError> {
        self.consume(TokenKind::OpenBrace, "Expected '{'")?;

        let mut fields = Vec::new();

        while !self.check(TokenKind::CloseBrace) {
            let field_name = self.consume(TokenKind::Identifier, "Expected field name")?;
            self.consume(TokenKind::Colon, "Expected field type")?;
            let mut field_type = self.consume_type("Expected field type")?;

            if self.matches(TokenKind::OpenSquare) {
                let count = self.consume(TokenKind::Number, "Expected array size")?;
                self.consume(TokenKind::CloseSquare, "Expected ']' after array size")?;
                field_type = Type::Array {
                    element: Box::new(field_type),
                    count: self.parse_count(&count)?,
                };
            }

            self.consume(TokenKind::Semicolon, "Expected ';' after field")?;
            fields.push((field_type, field_name.lexeme));
        }

        self.consume(TokenKind::CloseBrace, "Expected '}'")?;
        Ok(fields)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut statements = Vec::new();

        while !self.check(TokenKind::CloseBrace) {
            statements.push(self.parse_statement()?);
        }

        self.consume(TokenKind::CloseBrace, "Expected '}' after code block")?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        if self.matches(TokenKind::Var) {
            return self.parse_local_declaration();
        }

        if self.matches(TokenKind::Return) {
            let location = self.previous().location.clone();
            let value = if self.check(TokenKind::Semicolon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.consume(TokenKind::Semicolon, "Expected ';' after return statement")?;
            return Ok(Stmt::Return { value, location });
        }

        if self.matches(TokenKind::OpenBrace) {
            let mut body = Vec::new();
            while !self.check(TokenKind::CloseBrace) {
                body.push(self.parse_statement()?);
            }
            self.consume(TokenKind::CloseBrace, "Expected '}' after compound statement")?;
            return Ok(Stmt::Compound(body));
        }

        if self.matches(TokenKind::If) {
            self.consume(TokenKind::OpenParen, "Expected '(' after if keyword")?;
            let condition = self.parse_expression()?;
            self.consume(TokenKind::CloseParen, "Expected ')' after if expression")?;
            let body = Box::new(self.parse_statement()?);
            let else_body = if self.matches(TokenKind::Else) {
                Some(Box::new(self.parse_statement()?))
            } else {
                None
            };
            return Ok(Stmt::If {
                condition,
                body,
                else_body,
            });
        }

        if self.matches(TokenKind::While) {
            self.consume(TokenKind::OpenParen, "Expected '(' after while keyword")?;
            let condition = self.parse_expression()?;
            self.consume(TokenKind::CloseParen, "Expected ')' after while expression")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::While { condition, body });
        }

        if self.matches(TokenKind::Break) {
            let location = self.previous().location.clone();
            self.consume(TokenKind::Semicolon, "Expected ';' after break")?;
            return Ok(Stmt::Break { location });
        }

        if self.matches(TokenKind::Asm) {
            let value = self.consume(TokenKind::String, "Expected string")?;
            self.consume(TokenKind::Semicolon, "Expected ';' after asm")?;
            return Ok(Stmt::InlineAsm(strip_ends(&value.lexeme)));
        }

        if self.matches(TokenKind::Switch) {
            return self.parse_switch();
        }

        if self.matches(TokenKind::Push) {
            let value = self.parse_expression()?;
            self.consume(TokenKind::Semicolon, "Expected ';' after push statement")?;
            return Ok(Stmt::Push(value));
        }

        if self.matches(TokenKind::Pop) {
            let keyword = self.previous().lexeme.clone();
            let location = self.previous().location.clone();
            let name = if self.matches(TokenKind::Identifier) {
                Some(self.previous().lexeme.clone())
            } else {
                None
            };
            self.consume(
                TokenKind::Semicolon,
                format!("Expected ';' after {} statement", keyword),
            )?;
            return Ok(Stmt::Pop { name, location });
        }

        if self.matches(TokenKind::Call) {
            let name = self.consume(TokenKind::Identifier, "Expected function name")?;
            let args_passed = if self.matches(TokenKind::Number) {
                self.parse_count(&self.previous().clone())? as usize
            } else {
                0
            };
            self.consume(TokenKind::Semicolon, "Expected ';' after call statement")?;
            return Ok(Stmt::RawCall {
                name: name.lexeme,
                args_passed,
                location: name.location,
            });
        }

        let expr = self.parse_expression()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after expression statement")?;
        Ok(Stmt::Expression(expr))
    }

    fn parse_local_declaration(&mut self) -> Result<Stmt, CompileError> {
        let name = self.consume(TokenKind::Identifier, "Expected variable name")?;

        // Auto-typed local: the initializer decides the type.
        if self.matches(TokenKind::Equals) {
            let value = self.parse_expression()?;
            self.consume(
                TokenKind::Semicolon,
                "Expected ';' after local variable declaration",
            )?;
            return Ok(Stmt::Local {
                name: name.lexeme,
                ty: None,
                value: Some(value),
                location: name.location,
            });
        }

        self.consume(TokenKind::Colon, "Expected variable type")?;
        let ty = self.consume_type("Expected variable type")?;

        if self.matches(TokenKind::OpenSquare) {
            let count = self.consume(TokenKind::Number, "Expected array size")?;
            self.consume(TokenKind::CloseSquare, "Expected ']' after local array size")?;
            self.consume(
                TokenKind::Semicolon,
                "Expected ';' after local variable declaration",
            )?;
            return Ok(Stmt::LocalArray {
                name: name.lexeme,
                element: ty,
                count: self.parse_count(&count)?,
                location: name.location,
            });
        }

        if matches!(ty, Type::Struct(_)) && self.matches(TokenKind::Semicolon) {
            return Ok(Stmt::LocalStruct {
                name: name.lexeme,
                ty,
                location: name.location,
            });
        }

        if let Type::Class(class_name) = &ty {
            if self.matches(TokenKind::Semicolon) {
                return Ok(Stmt::LocalStruct {
                    name: name.lexeme,
                    ty,
                    location: name.location,
                });
            }

            // Constructor sugar: `var c : C(args);` reserves storage and
            // calls the initializer with its address.
            if self.matches(TokenKind::OpenParen) {
                let mut args = vec![Expr::Variable {
                    name: name.lexeme.clone(),
                    location: name.location.clone(),
                }];
                if !self.check(TokenKind::CloseParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(
                    TokenKind::CloseParen,
                    "Expected ')' after local class initializer",
                )?;
                self.consume(
                    TokenKind::Semicolon,
                    "Expected ';' after local variable declaration",
                )?;

                let init_call = Expr::Call {
                    name: format!("__{}_init_", class_name),
                    args,
                    location: name.location.clone(),
                };
                return Ok(Stmt::Multiple(vec![
                    Stmt::LocalStruct {
                        name: name.lexeme,
                        ty: ty.clone(),
                        location: name.location,
                    },
                    Stmt::Expression(init_call),
                ]));
            }
        }

        let value = if self.matches(TokenKind::Equals) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after local variable declaration",
        )?;
        Ok(Stmt::Local {
            name: name.lexeme,
            ty: Some(ty),
            value,
            location: name.location,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, CompileError> {
        self.consume(TokenKind::OpenParen, "Expected '(' after switch keyword")?;
        let value = self.parse_expression()?;
        self.consume(TokenKind::CloseParen, "Expected ')' after switch expression")?;
        self.consume(TokenKind::OpenBrace, "Expected switch body")?;

        let mut cases = Vec::new();
        let mut default_case = None;

        while !self.check(TokenKind::CloseBrace) {
            if self.matches(TokenKind::Default) {
                self.consume(TokenKind::Colon, "Expected ':'")?;
                let mut body = Vec::new();
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::CloseBrace)
                {
                    body.push(self.parse_statement()?);
                }
                default_case = Some(body);
            } else if self.matches(TokenKind::Case) {
                let constant = self
                    .consume_case_constant("Expected case expression (must be a constant number)")?;
                self.consume(TokenKind::Colon, "Expected ':'")?;
                let mut body = Vec::new();
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::CloseBrace)
                {
                    body.push(self.parse_statement()?);
                }
                cases.push((constant, body));
            } else {
                return Err(self.error_here("Expected a case"));
            }
        }

        self.consume(TokenKind::CloseBrace, "Expected '}' after switch cases")?;
        Ok(Stmt::Switch {
            value,
            cases,
            default_case,
        })
    }

    // Expression grammar, lowest precedence first.

    fn parse_expression(&mut self) -> Result<Expr, CompileError> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_bitwise()?;

        while self.matches(TokenKind::Equals) {
            let equals_location = self.previous().location.clone();
            let value = Box::new(self.parse_assign()?);

            left = match left {
                Expr::Variable { name, location } => Expr::Assign {
                    name,
                    value,
                    location,
                },
                Expr::Deref {
                    pointer,
                    offset,
                    location,
                } => Expr::StoreAt {
                    pointer,
                    offset,
                    value,
                    location,
                },
                Expr::Field {
                    object,
                    name,
                    location,
                } => Expr::SetField {
                    object,
                    name,
                    value,
                    location,
                },
                Expr::Register(name) => Expr::SetRegister { name, value },
                _ => return Err(self.error_at(equals_location, "Invalid assignment target")),
            };
        }

        Ok(left)
    }

    fn parse_bitwise(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_or_and()?;

        while self.match_any(&[TokenKind::Caret, TokenKind::Pipe, TokenKind::Ampersand]) {
            let op = self.previous().kind;
            let right = self.parse_or_and()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_or_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_equals()?;

        while self.match_any(&[TokenKind::And, TokenKind::Or, TokenKind::Percent]) {
            let op = self.previous().kind;
            let right = self.parse_equals()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equals(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_greater()?;

        while self.match_any(&[TokenKind::EqEq, TokenKind::NotEq]) {
            let op = self.previous().kind;
            let right = self.parse_greater()?;
            left = fold_binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_greater(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_greater_equals()?;

        while self.match_any(&[TokenKind::Greater, TokenKind::Less]) {
            let op = self.previous().kind;
            let right = self.parse_greater_equals()?;
            left = fold_binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_greater_equals(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_term()?;

        while self.match_any(&[TokenKind::GreaterEq, TokenKind::LessEq]) {
            let op = self.previous().kind;
            let right = self.parse_term()?;
            left = fold_binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_factor()?;

        while self.match_any(&[TokenKind::Plus, TokenKind::Minus]) {
            let op = self.previous().kind;
            let right = self.parse_factor()?;
            left = fold_binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_call()?;

        while self.match_any(&[TokenKind::Star, TokenKind::Slash]) {
            let op = self.previous().kind;
            let right = self.parse_call()?;
            left = fold_binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_call(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_primary()?;

        loop {
            if self.matches(TokenKind::OpenParen) {
                let location = self.previous().location.clone();
                let mut args = Vec::new();

                if !self.check(TokenKind::CloseParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(
                    TokenKind::CloseParen,
                    "Expected ')' after function call arguments",
                )?;

                left = match left {
                    Expr::Variable { name, .. } => Expr::Call {
                        name,
                        args,
                        location,
                    },
                    other => Expr::CallExpression {
                        target: Box::new(other),
                        args,
                        location,
                    },
                };
            } else if self.matches(TokenKind::OpenSquare) {
                let location = self.previous().location.clone();
                let offset = self.parse_expression()?;
                self.consume(
                    TokenKind::CloseSquare,
                    "Expected ']' after pointer dereference offset",
                )?;
                left = Expr::Deref {
                    pointer: Box::new(left),
                    offset: Box::new(offset),
                    location,
                };
            } else if self.matches(TokenKind::Dot) {
                let field_name = self.consume(TokenKind::Identifier, "Expected field name")?;
                left = Expr::Field {
                    object: Box::new(left),
                    name: field_name.lexeme,
                    location: field_name.location,
                };
            } else {
                break;
            }
        }

        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        if self.matches(TokenKind::Number) {
            let token = self.previous().clone();
            return Ok(Expr::Number(self.parse_integer(&token)?));
        }

        if self.matches(TokenKind::Char) {
            return Ok(Expr::Number(decode_char(&self.previous().lexeme)));
        }

        if self.matches(TokenKind::String) {
            let token = self.previous();
            return Ok(Expr::Str {
                value: token.lexeme.clone(),
                location: token.location.clone(),
            });
        }

        if self.matches(TokenKind::Identifier) {
            let token = self.previous();
            return Ok(Expr::Variable {
                name: token.lexeme.clone(),
                location: token.location.clone(),
            });
        }

        if self.matches(TokenKind::OpenParen) {
            if let Some(cast_type) = self.match_type()? {
                self.consume(TokenKind::CloseParen, "Expected ')' after cast type")?;
                let value = self.parse_expression()?;
                return Ok(Expr::Cast {
                    ty: cast_type,
                    value: Box::new(value),
                });
            }

            let expr = self.parse_expression()?;
            self.consume(TokenKind::CloseParen, "Expected ')' after expression")?;
            return Ok(expr);
        }

        // Unary minus lowers to `0 - x`.
        if self.matches(TokenKind::Minus) {
            let value = self.parse_call()?;
            return Ok(Expr::Binary {
                op: TokenKind::Minus,
                left: Box::new(Expr::Number(0)),
                right: Box::new(value),
            });
        }

        // `&&x` scans as AND; both it and `&x` read as address-of here.
        if self.match_any(&[TokenKind::And, TokenKind::Ampersand]) {
            let name = self.consume(TokenKind::Identifier, "Expected variable name")?;
            return Ok(Expr::AddressOf {
                name: name.lexeme,
                location: name.location,
            });
        }

        if self.matches(TokenKind::Star) {
            let location = self.previous().location.clone();
            let value = self.parse_bitwise()?;
            return Ok(Expr::Deref {
                pointer: Box::new(value),
                offset: Box::new(Expr::Number(0)),
                location,
            });
        }

        if self.matches(TokenKind::Bang) {
            let value = self.parse_bitwise()?;
            return Ok(Expr::Not(Box::new(value)));
        }

        if self.matches(TokenKind::True) {
            return Ok(Expr::Number(1));
        }
        if self.matches(TokenKind::False) {
            return Ok(Expr::Number(0));
        }

        if self.matches(TokenKind::Res) {
            return self.parse_reserve();
        }

        if self.matches(TokenKind::Sizeof) {
            self.consume(TokenKind::OpenParen, "Expected '(' after sizeof keyword")?;

            if let Some(ty) = self.match_type()? {
                self.consume(TokenKind::CloseParen, "Expected ')' after sizeof type")?;
                return Ok(Expr::SizeofType(ty));
            }

            let value = self.parse_expression()?;
            self.consume(TokenKind::CloseParen, "Expected ')' after sizeof value")?;
            return Ok(Expr::Sizeof(Box::new(value)));
        }

        if self.matches(TokenKind::New) {
            let name = self.consume(TokenKind::Identifier, "Expected class name")?;
            let mut args = Vec::new();

            if self.matches(TokenKind::OpenParen) {
                if !self.check(TokenKind::CloseParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(
                    TokenKind::CloseParen,
                    "Expected ')' after initializer arguments",
                )?;
            }

            return Ok(Expr::New {
                class: name.lexeme,
                args,
                location: name.location,
            });
        }

        if self.matches(TokenKind::Register) {
            let lexeme = &self.previous().lexeme;
            return Ok(Expr::Register(lexeme[1..].to_string()));
        }

        Err(self.error_here("Expected expression"))
    }

    fn parse_reserve(&mut self) -> Result<Expr, CompileError> {
        let location = self.previous().location.clone();
        let ty = self.consume_type("Expected reserve type")?;

        if self.matches(TokenKind::OpenSquare) {
            let mut values = Vec::new();

            if !self.check(TokenKind::CloseSquare) {
                loop {
                    values.push(self.parse_constant()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }

            self.consume(
                TokenKind::CloseSquare,
                "Expected ']' after reserve initial values",
            )?;
            return Ok(Expr::ReserveInit {
                ty,
                values,
                location,
            });
        }

        let count = self.consume(TokenKind::Number, "Expected reserve count")?;
        Ok(Expr::ReserveUninit {
            ty,
            count: self.parse_count(&count)?,
            location,
        })
    }

    /// Constant expressions allowed as `res` initializers.
    fn parse_constant(&mut self) -> Result<Expr, CompileError> {
        if self.matches(TokenKind::Number) {
            let token = self.previous().clone();
            return Ok(Expr::Number(self.parse_integer(&token)?));
        }

        if self.matches(TokenKind::String) {
            let token = self.previous();
            return Ok(Expr::Str {
                value: token.lexeme.clone(),
                location: token.location.clone(),
            });
        }

        if self.matches(TokenKind::Char) {
            return Ok(Expr::Number(decode_char(&self.previous().lexeme)));
        }

        if self.matches(TokenKind::True) {
            return Ok(Expr::Number(1));
        }
        if self.matches(TokenKind::False) {
            return Ok(Expr::Number(0));
        }

        if self.matches(TokenKind::Res) {
            return self.parse_reserve();
        }

        Err(self.error_here("Expected constant expression"))
    }

    /// Switch case discriminators: integer, char, or `Enum.Member`.
    fn consume_case_constant(&mut self, error_msg: &str) -> Result<i64, CompileError> {
        if self.matches(TokenKind::Number) {
            let token = self.previous().clone();
            return self.parse_integer(&token);
        }

        if self.matches(TokenKind::Char) {
            return Ok(decode_char(&self.previous().lexeme));
        }

        if self.matches(TokenKind::Identifier) {
            let enum_name = self.previous().clone();
            if self.matches(TokenKind::Dot) {
                let member = self.consume(TokenKind::Identifier, "Expected field name after '.'")?;

                if let Some(values) = self.enums.get(&enum_name.lexeme) {
                    return values.get(&member.lexeme).copied().ok_or_else(|| {
                        self.error_at(
                            member.location.clone(),
                            format!(
                                "Unknown enum value '{}' in enum '{}'",
                                member.lexeme, enum_name.lexeme
                            ),
                        )
                    });
                }
            }
        }

        Err(self.error_here(error_msg))
    }

    // Type parsing.

    /// Try to parse a type at the cursor. Consumes tokens only on
    /// success; an identifier that doesn't name a declared type leaves
    /// the cursor untouched and yields `None`.
    fn match_type(&mut self) -> Result<Option<Type>, CompileError> {
        const PRIMITIVES: &[TokenKind] = &[
            TokenKind::U8,
            TokenKind::U16,
            TokenKind::U32,
            TokenKind::U64,
            TokenKind::I8,
            TokenKind::I16,
            TokenKind::I32,
            TokenKind::I64,
            TokenKind::Ptr,
        ];

        if !self.match_any(PRIMITIVES) {
            if self.matches(TokenKind::Struct) {
                let id = self.next_substruct_id;
                self.next_substruct_id += 1;
                let fields = self.parse_struct_fields()?;
                return Ok(Some(Type::SubStruct { id, fields }));
            }

            let Some(def) = self.typedefs.get(&self.peek().lexeme) else {
                return Ok(None);
            };

            let mut ty = def.ty.clone();
            self.advance();

            while self.matches(TokenKind::Star) {
                ty = Type::pointer_to(ty);
            }
            return Ok(Some(ty));
        }

        let mut ty = match self.previous().kind {
            TokenKind::U8 => Type::U8,
            TokenKind::U16 => Type::U16,
            TokenKind::U32 => Type::U32,
            TokenKind::U64 => Type::U64,
            TokenKind::I8 => Type::I8,
            TokenKind::I16 => Type::I16,
            TokenKind::I32 => Type::I32,
            TokenKind::I64 => Type::I64,
            _ => Type::Ptr(None),
        };

        while self.matches(TokenKind::Star) {
            ty = Type::pointer_to(ty);
        }

        Ok(Some(ty))
    }

    fn consume_type(&mut self, error_msg: &str) -> Result<Type, CompileError> {
        match self.match_type()? {
            Some(ty) => Ok(ty),
            None => Err(self.error_here(error_msg)),
        }
    }

    fn declare_type(&mut self, name: &Token, ty: Type, declared: bool) {
        self.typedefs.insert(
            name.lexeme.clone(),
            TypeDef {
                ty,
                declared,
                location: name.location.clone(),
            },
        );
    }

    // Token helpers.

    fn match_any(&mut self, kinds: &[TokenKind]) -> bool {
        for kind in kinds {
            if self.check(*kind) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn consume(
        &mut self,
        kind: TokenKind,
        error_msg: impl Into<String>,
    ) -> Result<Token, CompileError> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        Err(self.error_here(error_msg))
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        token
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn available(&self) -> bool {
        self.peek().kind != TokenKind::Eof
    }

    fn parse_integer(&self, token: &Token) -> Result<i64, CompileError> {
        token.lexeme.parse::<i64>().map_err(|_| {
            self.error_at(token.location.clone(), "Integer literal out of range")
        })
    }

    fn parse_count(&self, token: &Token) -> Result<u64, CompileError> {
        token.lexeme.parse::<u64>().map_err(|_| {
            self.error_at(token.location.clone(), "Integer literal out of range")
        })
    }

    fn error_here(&self, error_msg: impl Into<String>) -> CompileError {
        self.error_at(self.peek().location.clone(), error_msg)
    }

    fn error_at(&self, location: SourceLocation, error_msg: impl Into<String>) -> CompileError {
        CompileError::parse(error_msg, location)
    }
}

/// Collapse a binary operation over two integer literals to a literal.
/// Comparisons yield 0 or 1; division truncates toward zero and is left
/// unfolded when the divisor is zero.
fn fold_binary(op: TokenKind, left: Expr, right: Expr) -> Expr {
    if let (Expr::Number(a), Expr::Number(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let folded = match op {
            TokenKind::Plus => Some(a.wrapping_add(b)),
            TokenKind::Minus => Some(a.wrapping_sub(b)),
            TokenKind::Star => Some(a.wrapping_mul(b)),
            TokenKind::Slash => (b != 0).then(|| a.wrapping_div(b)),
            TokenKind::EqEq => Some((a == b) as i64),
            TokenKind::NotEq => Some((a != b) as i64),
            TokenKind::Greater => Some((a > b) as i64),
            TokenKind::Less => Some((a < b) as i64),
            TokenKind::GreaterEq => Some((a >= b) as i64),
            TokenKind::LessEq => Some((a <= b) as i64),
            _ => None,
        };
        if let Some(value) = folded {
            return Expr::Number(value);
        }
    }

    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Decode a char literal lexeme (quotes included) to its integer value.
/// Shared by expression primaries and switch-case constants.
pub(crate) fn decode_char(lexeme: &str) -> i64 {
    let inner = strip_ends(lexeme);
    match inner.as_str() {
        "\\0" => 0,
        "\\n" => '\n' as i64,
        "\\r" => '\r' as i64,
        "\\t" => '\t' as i64,
        "\\'" => '\'' as i64,
        "\\\\" => '\\' as i64,
        other => other.chars().next().map(|c| c as i64).unwrap_or(0),
    }
}

/// Drop the first and last character of a quoted lexeme.
fn strip_ends(lexeme: &str) -> String {
    let mut chars = lexeme.chars();
    chars.next();
    chars.next_back();
    chars.as_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;

    fn parse(source: &str) -> Vec<Decl> {
        let tokens = Scanner::new(source, "test.hz").scan().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        let tokens = Scanner::new(source, "test.hz").scan().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    /// Parse a single expression by wrapping it in a procedure body.
    fn parse_expr(source: &str) -> Expr {
        let decls = parse(&format!("proc t() {{ {}; }}", source));
        let Decl::Procedure(proc) = &decls[0] else {
            panic!("expected procedure");
        };
        let Some(Stmt::Expression(expr)) = proc.body.as_ref().and_then(|b| b.first()) else {
            panic!("expected expression statement");
        };
        expr.clone()
    }

    #[test]
    fn test_constant_folding_arithmetic() {
        assert_eq!(parse_expr("2 + 3"), Expr::Number(5));
        assert_eq!(parse_expr("2 - 3"), Expr::Number(-1));
        assert_eq!(parse_expr("6 * 7"), Expr::Number(42));
        assert_eq!(parse_expr("7 / 2"), Expr::Number(3));
    }

    #[test]
    fn test_constant_folding_comparisons() {
        assert_eq!(parse_expr("1 == 1"), Expr::Number(1));
        assert_eq!(parse_expr("1 != 1"), Expr::Number(0));
        assert_eq!(parse_expr("2 > 1"), Expr::Number(1));
        assert_eq!(parse_expr("2 < 1"), Expr::Number(0));
        assert_eq!(parse_expr("2 >= 2"), Expr::Number(1));
        assert_eq!(parse_expr("1 <= 0"), Expr::Number(0));
    }

    #[test]
    fn test_division_by_zero_literal_is_not_folded() {
        assert!(matches!(
            parse_expr("1 / 0"),
            Expr::Binary {
                op: TokenKind::Slash,
                ..
            }
        ));
    }

    #[test]
    fn test_multiplication_binds_tighter_than_addition() {
        // With variables so nothing folds away.
        let expr = parse_expr("a + b * c");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, TokenKind::Plus);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: TokenKind::Star,
                ..
            }
        ));
    }

    #[test]
    fn test_equality_binds_tighter_than_and() {
        let expr = parse_expr("a == b and c");
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, TokenKind::And);
        assert!(matches!(
            *left,
            Expr::Binary {
                op: TokenKind::EqEq,
                ..
            }
        ));
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let expr = parse_expr("a = b = 1");
        let Expr::Assign { name, value, .. } = expr else {
            panic!("expected assignment");
        };
        assert_eq!(name, "a");
        assert!(matches!(*value, Expr::Assign { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("proc t() { 1 = 2; }");
        assert!(err.to_string().contains("Invalid assignment target"));
    }

    #[test]
    fn test_macro_substitution_then_folding() {
        // SQ(3+1) substitutes to 3+1*3+1, which folds to 7 by precedence.
        let tokens = Scanner::new(
            "%define SQ(x) [x * x] proc t() { SQ(3+1); }",
            "test.hz",
        )
        .scan()
        .unwrap();
        let tokens = crate::preprocessor::Preprocessor::new()
            .preprocess(tokens, &[])
            .unwrap();
        let decls = Parser::new(tokens).parse().unwrap();
        let Decl::Procedure(proc) = &decls[0] else {
            panic!("expected procedure");
        };
        assert_eq!(
            proc.body.as_ref().unwrap()[0],
            Stmt::Expression(Expr::Number(7))
        );
    }

    #[test]
    fn test_unary_minus_lowering() {
        let expr = parse_expr("-x");
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, TokenKind::Minus);
        assert_eq!(*left, Expr::Number(0));
    }

    #[test]
    fn test_char_escapes() {
        assert_eq!(parse_expr("'A'"), Expr::Number(65));
        assert_eq!(parse_expr(r"'\n'"), Expr::Number(10));
        assert_eq!(parse_expr(r"'\0'"), Expr::Number(0));
        assert_eq!(parse_expr(r"'\\'"), Expr::Number(92));
    }

    #[test]
    fn test_cast_form_of_parenthesized_expression() {
        let expr = parse_expr("(u8) x");
        assert!(matches!(expr, Expr::Cast { ty: Type::U8, .. }));
    }

    #[test]
    fn test_pointer_type_wrapping() {
        let decls = parse("var p : u32**;");
        let Decl::Variable { ty, .. } = &decls[0] else {
            panic!("expected variable");
        };
        assert_eq!(
            *ty,
            Type::pointer_to(Type::pointer_to(Type::U32))
        );
    }

    #[test]
    fn test_enum_auto_increment() {
        let decls = parse("enum Color { RED, GREEN = 5, BLUE }");
        let Decl::Enum { values, .. } = &decls[0] else {
            panic!("expected enum");
        };
        assert_eq!(
            *values,
            vec![
                ("RED".to_string(), 0),
                ("GREEN".to_string(), 5),
                ("BLUE".to_string(), 6)
            ]
        );
    }

    #[test]
    fn test_enum_member_as_case_constant() {
        let decls = parse(
            "enum Color { RED, GREEN } proc t(c:u64) { switch (c) { case Color.GREEN: break; } }",
        );
        let Decl::Procedure(proc) = &decls[1] else {
            panic!("expected procedure");
        };
        let Some(Stmt::Switch { cases, .. }) = proc.body.as_ref().and_then(|b| b.first()) else {
            panic!("expected switch");
        };
        assert_eq!(cases[0].0, 1);
    }

    #[test]
    fn test_class_desugars_to_mangled_procedures() {
        let decls = parse(
            "class Counter { var v : i32; Counter(n:i32) { } proc get() -> i32 { return 0; } }",
        );
        assert!(matches!(decls[0], Decl::Class(_)));
        let names: Vec<&str> = decls[1..]
            .iter()
            .map(|d| match d {
                Decl::Procedure(p) => p.name.as_str(),
                _ => panic!("expected procedure"),
            })
            .collect();
        assert_eq!(names, vec!["__Counter_init_", "__Counter_proc_get"]);

        let Decl::Procedure(init) = &decls[1] else {
            panic!();
        };
        assert!(init.always_emit);
        assert_eq!(init.args[0].1, "this");
        assert_eq!(init.args[0].0, Type::Class("Counter".into()));
    }

    #[test]
    fn test_local_class_constructor_sugar() {
        let decls = parse("class C { C() { } } proc t() { var c : C(1); }");
        let Decl::Procedure(proc) = decls.last().unwrap() else {
            panic!("expected procedure");
        };
        let Some(Stmt::Multiple(parts)) = proc.body.as_ref().and_then(|b| b.first()) else {
            panic!("expected expanded declaration");
        };
        assert!(matches!(parts[0], Stmt::LocalStruct { .. }));
        let Stmt::Expression(Expr::Call { name, args, .. }) = &parts[1] else {
            panic!("expected initializer call");
        };
        assert_eq!(name, "__C_init_");
        assert_eq!(args.len(), 2);
        assert!(matches!(&args[0], Expr::Variable { name, .. } if name == "c"));
    }

    #[test]
    fn test_forward_declared_struct_must_be_defined() {
        let err = parse_err("struct S; proc t() { }");
        assert!(err.to_string().contains("never defined"));
    }

    #[test]
    fn test_forward_then_defined_struct_is_fine() {
        let decls = parse("struct S; struct S { x : u8; }");
        assert!(matches!(decls[0], Decl::Struct { .. }));
    }

    #[test]
    fn test_varargs_parameter_list() {
        let decls = parse("external proc printf(fmt:u8*, ...) -> i32;");
        let Decl::ExternProcedure { varargs, args, .. } = &decls[0] else {
            panic!("expected extern procedure");
        };
        assert!(varargs);
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_unknown_case_discriminator() {
        let err = parse_err("proc t(x:u64) { switch (x) { case foo: break; } }");
        assert!(err.to_string().contains("Expected case expression"));
    }

    #[test]
    fn test_register_expression() {
        let expr = parse_expr("%rax = 1");
        assert!(matches!(expr, Expr::SetRegister { ref name, .. } if name == "rax"));
    }

    #[test]
    fn test_sub_struct_local_type() {
        let decls = parse("proc t() { var p : struct { x : i32; y : i32; }; }");
        let Decl::Procedure(proc) = &decls[0] else {
            panic!("expected procedure");
        };
        let Some(Stmt::Local { ty: Some(ty), .. }) = proc.body.as_ref().and_then(|b| b.first())
        else {
            panic!("expected local");
        };
        assert!(matches!(ty, Type::SubStruct { fields, .. } if fields.len() == 2));
    }
}
