//! Typed AST produced by the parser.
//!
//! Nodes are closed enums: declarations, statements and expressions.
//! Assignment forms (`Assign`, `StoreAt`, `SetField`, `SetRegister`) are
//! expressions because assignment yields a value and nests on the right.

use crate::error::SourceLocation;
use crate::scanner::TokenKind;

/// A field or parameter: type plus name.
pub type Field = (Type, String);

/// Resolved source-level type.
///
/// Aggregates (`Struct`, `Class`) carry their name and are resolved
/// against the generator's layout tables. `SubStruct` is an inline
/// anonymous struct; its `id` keys the generator's layout cache so the
/// AST itself stays immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Pointer, optionally typed. An untyped pointer cannot be
    /// dereferenced.
    Ptr(Option<Box<Type>>),
    ProcPtr,
    Struct(String),
    SubStruct { id: usize, fields: Vec<Field> },
    Class(String),
    Array { element: Box<Type>, count: u64 },
    /// Absent type: a procedure with no return value.
    Void,
}

impl Type {
    pub fn pointer_to(base: Type) -> Type {
        Type::Ptr(Some(Box::new(base)))
    }

    /// Width in bytes when the value sits in a register or a local slot.
    /// Aggregates are handled by reference, so they count as one pointer.
    pub fn size(&self) -> u64 {
        match self {
            Type::U8 | Type::I8 => 1,
            Type::U16 | Type::I16 => 2,
            Type::U32 | Type::I32 => 4,
            Type::U64 | Type::I64 => 8,
            Type::Ptr(_) | Type::ProcPtr => 8,
            Type::Struct(_) | Type::SubStruct { .. } | Type::Class(_) => 8,
            Type::Array { element, count } => element.size() * count,
            Type::Void => 0,
        }
    }

    /// Assembly operand width name for this type's register/slot size.
    pub fn asm_width(&self) -> &'static str {
        match self.size() {
            1 => "byte",
            2 => "word",
            4 => "dword",
            _ => "qword",
        }
    }

    /// FASM data-directive letter (`db`/`dw`/`dd`/`dq`, `rb`/`rw`/`rd`/`rq`).
    pub fn asm_letter(&self) -> char {
        match self {
            Type::Array { element, .. } => element.asm_letter(),
            _ => match self.size() {
                1 => 'b',
                2 => 'w',
                4 => 'd',
                _ => 'q',
            },
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::U8
                | Type::U16
                | Type::U32
                | Type::U64
                | Type::I8
                | Type::I16
                | Type::I32
                | Type::I64
        )
    }

    /// Signed types narrower than 32 bits load with `movsx`.
    pub fn is_signed_narrow(&self) -> bool {
        matches!(self, Type::I8 | Type::I16)
    }

    /// Unsigned types narrower than 64 bits load zero-extended.
    pub fn is_unsigned_narrow(&self) -> bool {
        matches!(self, Type::U8 | Type::U16 | Type::U32)
    }
}

/// Signature of a class method or initializer. Argument lists include
/// the implicit leading `this` parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub args: Vec<Field>,
    pub varargs: bool,
    pub return_type: Type,
}

/// A top-level procedure, either written by the user or desugared from a
/// class method/initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcDecl {
    pub name: String,
    pub return_type: Type,
    /// `None` for a forward declaration.
    pub body: Option<Vec<Stmt>>,
    pub args: Vec<Field>,
    pub location: SourceLocation,
    pub varargs: bool,
    pub stdcall: bool,
    pub is_local: bool,
    /// Emit even when never referenced (class initializers).
    pub always_emit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub members: Vec<Field>,
    pub methods: Vec<(String, MethodSig)>,
    pub initializer: Option<MethodSig>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Variable {
        name: String,
        ty: Type,
        is_local: bool,
        location: SourceLocation,
    },
    Procedure(ProcDecl),
    ExternProcedure {
        name: String,
        return_type: Type,
        args: Vec<Field>,
        varargs: bool,
        stdcall: bool,
        location: SourceLocation,
    },
    ExternVariable {
        name: String,
        ty: Type,
        location: SourceLocation,
    },
    Struct {
        name: String,
        members: Vec<Field>,
        location: SourceLocation,
    },
    Class(ClassDecl),
    Enum {
        name: String,
        values: Vec<(String, i64)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `var name [: ty] [= value];` — `ty` is `None` for auto-typed
    /// locals, which always carry a value.
    Local {
        name: String,
        ty: Option<Type>,
        value: Option<Expr>,
        location: SourceLocation,
    },
    /// `var name : element [count];`
    LocalArray {
        name: String,
        element: Type,
        count: u64,
        location: SourceLocation,
    },
    /// `var name : StructOrClass;` — inline storage plus a pointer slot.
    LocalStruct {
        name: String,
        ty: Type,
        location: SourceLocation,
    },
    Expression(Expr),
    Return {
        value: Option<Expr>,
        location: SourceLocation,
    },
    If {
        condition: Expr,
        body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Break {
        location: SourceLocation,
    },
    Compound(Vec<Stmt>),
    Switch {
        value: Expr,
        cases: Vec<(i64, Vec<Stmt>)>,
        default_case: Option<Vec<Stmt>>,
    },
    /// Raw stack-machine push.
    Push(Expr),
    /// Raw pop, optionally into a variable; bare `pop`/`drop` discards.
    Pop {
        name: Option<String>,
        location: SourceLocation,
    },
    /// Raw call: arguments are whatever sits on the stack.
    RawCall {
        name: String,
        args_passed: usize,
        location: SourceLocation,
    },
    /// Verbatim assembly line.
    InlineAsm(String),
    /// Several statements produced by one source construct.
    Multiple(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    /// Raw string lexeme, quotes included; escapes resolve at emission.
    Str {
        value: String,
        location: SourceLocation,
    },
    Variable {
        name: String,
        location: SourceLocation,
    },
    Assign {
        name: String,
        value: Box<Expr>,
        location: SourceLocation,
    },
    Binary {
        op: TokenKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        location: SourceLocation,
    },
    /// Call on a non-identifier target; in practice a method call
    /// `object.method(args)`.
    CallExpression {
        target: Box<Expr>,
        args: Vec<Expr>,
        location: SourceLocation,
    },
    Cast {
        ty: Type,
        value: Box<Expr>,
    },
    AddressOf {
        name: String,
        location: SourceLocation,
    },
    /// `pointer[offset]` or `*pointer` (offset 0).
    Deref {
        pointer: Box<Expr>,
        offset: Box<Expr>,
        location: SourceLocation,
    },
    /// `pointer[offset] = value`.
    StoreAt {
        pointer: Box<Expr>,
        offset: Box<Expr>,
        value: Box<Expr>,
        location: SourceLocation,
    },
    /// `res TYPE count` — uninitialized reservation in `.bss`.
    ReserveUninit {
        ty: Type,
        count: u64,
        location: SourceLocation,
    },
    /// `res TYPE [ a, b, … ]` — initialized reservation in `.data`.
    ReserveInit {
        ty: Type,
        values: Vec<Expr>,
        location: SourceLocation,
    },
    /// `object.name` — also carries enum constant access.
    Field {
        object: Box<Expr>,
        name: String,
        location: SourceLocation,
    },
    /// `object.name = value`.
    SetField {
        object: Box<Expr>,
        name: String,
        value: Box<Expr>,
        location: SourceLocation,
    },
    Sizeof(Box<Expr>),
    SizeofType(Type),
    /// Logical negation `!expr`, yielding 0 or 1.
    Not(Box<Expr>),
    New {
        class: String,
        args: Vec<Expr>,
        location: SourceLocation,
    },
    /// Named register read, e.g. `%rax`.
    Register(String),
    /// Named register write, e.g. `%rax = expr`.
    SetRegister {
        name: String,
        value: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(Type::U8.size(), 1);
        assert_eq!(Type::I16.size(), 2);
        assert_eq!(Type::U32.size(), 4);
        assert_eq!(Type::I64.size(), 8);
        assert_eq!(Type::Ptr(None).size(), 8);
    }

    #[test]
    fn test_array_size_is_element_times_count() {
        let ty = Type::Array {
            element: Box::new(Type::U16),
            count: 10,
        };
        assert_eq!(ty.size(), 20);
        assert_eq!(ty.asm_letter(), 'w');
    }

    #[test]
    fn test_asm_widths() {
        assert_eq!(Type::U8.asm_width(), "byte");
        assert_eq!(Type::I32.asm_width(), "dword");
        assert_eq!(Type::Class("C".into()).asm_width(), "qword");
    }

    #[test]
    fn test_extension_classes() {
        assert!(Type::I8.is_signed_narrow());
        assert!(!Type::I32.is_signed_narrow());
        assert!(Type::U32.is_unsigned_narrow());
        assert!(!Type::U64.is_unsigned_narrow());
    }
}
