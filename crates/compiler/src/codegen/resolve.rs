//! Static type resolution for expressions, plus the assignment and
//! argument compatibility checks.
//!
//! Validation is deliberately permissive: all pointers are mutually
//! assignable regardless of base type, and numeric kinds mix silently
//! across widths and signedness. Aggregates must match by name.

use super::{FieldInfo, Generator};
use crate::ast::{Expr, Type};
use crate::error::{CompileError, SourceLocation};
use crate::scanner::TokenKind;

impl Generator {
    /// Resolve the static type an expression produces.
    pub(super) fn resolve_type(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        match expr {
            Expr::Number(_) => Ok(Type::I64),

            // A bare string is an untyped pointer into `.data`.
            Expr::Str { .. } => Ok(Type::Ptr(None)),

            Expr::Variable { name, location } => self
                .variable_type(name)
                .ok_or_else(|| undefined_variable(name, location)),

            Expr::Assign { name, location, .. } => {
                self.variable_type(name).ok_or_else(|| {
                    CompileError::generate(
                        format!("Attempted assigning to an undefined variable '{}'", name),
                        location.clone(),
                    )
                })
            }

            Expr::Binary { op, left, right } => {
                let left_type = self.resolve_type(left)?;
                let right_type = self.resolve_type(right)?;

                match op {
                    TokenKind::Plus
                    | TokenKind::Minus
                    | TokenKind::Star
                    | TokenKind::Slash
                    | TokenKind::And
                    | TokenKind::Caret
                    | TokenKind::Pipe
                    | TokenKind::Ampersand => {
                        if left_type.size() > right_type.size() {
                            Ok(left_type)
                        } else {
                            Ok(right_type)
                        }
                    }
                    TokenKind::Percent
                    | TokenKind::EqEq
                    | TokenKind::NotEq
                    | TokenKind::Greater
                    | TokenKind::GreaterEq
                    | TokenKind::Less
                    | TokenKind::LessEq
                    | TokenKind::Or => Ok(Type::U8),
                    other => Err(self.bug(format!(
                        "no type resolution for binary operator {:?}",
                        other
                    ))),
                }
            }

            Expr::Call { name, location, .. } => self
                .functions
                .get(name)
                .map(|info| info.return_type.clone())
                .ok_or_else(|| {
                    CompileError::generate(
                        format!("Tried calling an undefined procedure '{}'", name),
                        location.clone(),
                    )
                }),

            Expr::CallExpression {
                target, location, ..
            } => {
                let (_, _, method) = self.resolve_method(target, location)?;
                Ok(method.return_type)
            }

            Expr::Cast { ty, .. } => Ok(ty.clone()),

            Expr::Deref {
                pointer, location, ..
            } => {
                let pointer_type = self.resolve_type(pointer)?;
                pointer_base(&pointer_type).ok_or_else(|| {
                    CompileError::generate(
                        "Tried dereferencing a pointer with no base type",
                        location.clone(),
                    )
                })
            }

            Expr::StoreAt { pointer, .. } => {
                let pointer_type = self.resolve_type(pointer)?;
                match pointer_base(&pointer_type) {
                    Some(base) => Ok(Type::pointer_to(base)),
                    None => Ok(Type::Ptr(None)),
                }
            }

            Expr::AddressOf { name, location } => self
                .variable_type(name)
                .map(Type::pointer_to)
                .ok_or_else(|| undefined_variable(name, location)),

            Expr::ReserveUninit { ty, .. } | Expr::ReserveInit { ty, .. } => {
                Ok(Type::pointer_to(ty.clone()))
            }

            Expr::Field {
                object,
                name,
                location,
            } => {
                if self.enum_constant(object, name, location)?.is_some() {
                    return Ok(Type::U64);
                }

                let object_type = self.resolve_type(object)?;
                let info = self.field_info(&object_type, name, location)?;

                if let Type::Array { element, .. } = &info.ty {
                    return Ok(Type::pointer_to((**element).clone()));
                }
                Ok(info.ty)
            }

            Expr::SetField {
                object,
                name,
                location,
                ..
            } => {
                let object_type = self.resolve_type(object)?;
                Ok(self.field_info(&object_type, name, location)?.ty)
            }

            Expr::Sizeof(_) | Expr::SizeofType(_) => Ok(Type::U64),

            Expr::Not(_) => Ok(Type::U8),

            Expr::New {
                class, location, ..
            } => {
                if !self.classes.contains_key(class) {
                    return Err(CompileError::generate(
                        format!("Unknown class '{}'", class),
                        location.clone(),
                    ));
                }
                Ok(Type::Class(class.clone()))
            }

            Expr::Register(_) | Expr::SetRegister { .. } => Ok(Type::U64),
        }
    }

    fn variable_type(&self, name: &str) -> Option<Type> {
        if let Some(slot) = self.scopes.get(name) {
            return Some(slot.ty.clone());
        }
        self.globals.get(name).cloned()
    }

    /// If `object.name` is an enum constant access, yield its value.
    pub(super) fn enum_constant(
        &self,
        object: &Expr,
        member: &str,
        location: &SourceLocation,
    ) -> Result<Option<i64>, CompileError> {
        let Expr::Variable { name, .. } = object else {
            return Ok(None);
        };
        let Some(values) = self.enums.get(name) else {
            return Ok(None);
        };

        match values.get(member) {
            Some(value) => Ok(Some(*value)),
            None => Err(CompileError::generate(
                format!("Unknown enum value '{}' in enum '{}'", member, name),
                location.clone(),
            )),
        }
    }

    /// Look up a field of an aggregate type.
    pub(super) fn field_info(
        &mut self,
        object_type: &Type,
        field: &str,
        location: &SourceLocation,
    ) -> Result<FieldInfo, CompileError> {
        let fields = match object_type {
            Type::Struct(name) | Type::Class(name) => self
                .struct_layouts
                .get(name)
                .ok_or_else(|| self.bug(format!("no layout registered for '{}'", name)))?
                .fields
                .clone(),
            Type::SubStruct { id, fields } => self.substruct_layout(*id, fields)?.fields,
            _ => {
                return Err(CompileError::generate(
                    "Attempted field access on a non struct type",
                    location.clone(),
                ));
            }
        };

        fields.get(field).cloned().ok_or_else(|| {
            CompileError::generate(format!("Unknown field '{}'", field), location.clone())
        })
    }

    /// Resolve `object.method` on a class receiver; yields the class
    /// name, mangled symbol and the method's signature.
    pub(super) fn resolve_method(
        &mut self,
        target: &Expr,
        location: &SourceLocation,
    ) -> Result<(String, String, crate::ast::MethodSig), CompileError> {
        let Expr::Field {
            object,
            name: method_name,
            ..
        } = target
        else {
            return Err(CompileError::generate(
                "Invalid call target, must be a variable, procedure or class method",
                location.clone(),
            ));
        };

        let holder_type = self.resolve_type(object)?;
        let Type::Class(class_name) = holder_type else {
            return Err(CompileError::generate(
                "Tried calling a method from a non class value",
                location.clone(),
            ));
        };

        let class = self
            .classes
            .get(&class_name)
            .ok_or_else(|| self.bug(format!("no class data for '{}'", class_name)))?;

        let method = class.methods.get(method_name).cloned().ok_or_else(|| {
            CompileError::generate(
                format!(
                    "Unknown method '{}' for class '{}'",
                    method_name, class_name
                ),
                location.clone(),
            )
        })?;

        let mangled = format!("__{}_proc_{}", class_name, method_name);
        Ok((class_name, mangled, method))
    }

    /// Assignment compatibility; errors name the variable and both types.
    pub(super) fn validate_assignment(
        &self,
        expected: &Type,
        given: &Type,
        location: &SourceLocation,
        variable: &str,
    ) -> Result<(), CompileError> {
        if types_compatible(expected, given) {
            return Ok(());
        }
        Err(CompileError::generate(
            format!(
                "Tried assigning non matching types for variable '{}', expected '{}', but got '{}'",
                variable,
                type_name(expected),
                type_name(given)
            ),
            location.clone(),
        ))
    }

    /// Call-argument compatibility; errors name the callee and position.
    pub(super) fn validate_argument(
        &self,
        expected: &Type,
        given: &Type,
        callee: &str,
        position: usize,
        location: &SourceLocation,
    ) -> Result<(), CompileError> {
        if types_compatible(expected, given) {
            return Ok(());
        }
        Err(CompileError::generate(
            format!(
                "Passed wrong type of parameter to function '{}', parameter #{} expected '{}', but got '{}'",
                callee,
                position,
                type_name(expected),
                type_name(given)
            ),
            location.clone(),
        ))
    }
}

/// The base type behind a typed pointer; `None` for anything else.
pub(super) fn pointer_base(ty: &Type) -> Option<Type> {
    match ty {
        Type::Ptr(Some(base)) => Some((**base).clone()),
        _ => None,
    }
}

fn types_compatible(expected: &Type, given: &Type) -> bool {
    match (expected, given) {
        (Type::Ptr(_), Type::Ptr(_)) => true,
        (Type::Struct(a), Type::Struct(b)) => a == b,
        (Type::Class(a), Type::Class(b)) => a == b,
        (Type::SubStruct { .. }, Type::SubStruct { .. }) => true,
        _ => expected.is_numeric() && given.is_numeric(),
    }
}

/// Human-readable type name for diagnostics.
pub(super) fn type_name(ty: &Type) -> String {
    match ty {
        Type::U8 => "u8".into(),
        Type::U16 => "u16".into(),
        Type::U32 => "u32".into(),
        Type::U64 => "u64".into(),
        Type::I8 => "i8".into(),
        Type::I16 => "i16".into(),
        Type::I32 => "i32".into(),
        Type::I64 => "i64".into(),
        Type::Ptr(_) => "ptr".into(),
        Type::ProcPtr => "procptr".into(),
        Type::Struct(name) | Type::Class(name) => name.clone(),
        Type::SubStruct { .. } => "struct".into(),
        Type::Array { .. } => "array".into(),
        Type::Void => "none".into(),
    }
}

fn undefined_variable(name: &str, location: &SourceLocation) -> CompileError {
    CompileError::generate(
        format!("Undefined variable '{}'", name),
        location.clone(),
    )
}
