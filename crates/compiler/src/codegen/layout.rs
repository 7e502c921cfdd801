//! Struct and class field layout.
//!
//! Layout is computed once per declaration: each field's offset is the
//! running width padded up to the field's own alignment, and the total
//! size is padded up to the alignment of the widest member. Inline
//! sub-structs are laid out recursively; their layouts live in a side
//! cache keyed by the sub-struct's parser-assigned id, so the AST stays
//! immutable.

use super::Generator;
use crate::ast::{Field, Type};
use crate::error::CompileError;
use std::collections::HashMap;

/// One laid-out field: byte offset from the aggregate's start, stored
/// width, and the field's type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub offset: u64,
    pub size: u64,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructLayout {
    pub fields: HashMap<String, FieldInfo>,
    /// Total size, padded to a multiple of `largest`.
    pub size: u64,
    /// Alignment of the widest member.
    pub largest: u64,
}

impl Generator {
    /// Lay out a field list. Alignment rules: a primitive or pointer
    /// aligns to its own size, an array to its element size, and a
    /// sub-struct to its widest member.
    pub(super) fn calculate_struct(
        &mut self,
        members: &[Field],
    ) -> Result<StructLayout, CompileError> {
        let mut fields = HashMap::new();
        let mut largest = 1u64;
        let mut width = 0u64;

        for (field_type, field_name) in members {
            let mut padding = 0u64;
            let size;

            match field_type {
                Type::SubStruct {
                    id,
                    fields: sub_fields,
                } => {
                    let sub = self.substruct_layout(*id, sub_fields)?;
                    size = sub.size;
                    if sub.largest > largest {
                        largest = sub.largest;
                    }
                }
                Type::Array { element, count } => {
                    let element_size = element.size();
                    size = element_size * count;
                    if element_size > largest {
                        largest = element_size;
                    }
                    padding = Self::padding_for(width, element_size);
                }
                _ => {
                    size = field_type.size();
                    if size > largest {
                        largest = size;
                    }
                    padding = Self::padding_for(width, size);
                }
            }

            let offset = width + padding;
            fields.insert(
                field_name.clone(),
                FieldInfo {
                    offset,
                    size,
                    ty: field_type.clone(),
                },
            );
            width += size + padding;
        }

        if width % largest != 0 {
            width += largest - width % largest;
        }

        Ok(StructLayout {
            fields,
            size: width,
            largest,
        })
    }

    /// Layout for an inline sub-struct, computed on first use and cached
    /// by the type's id.
    pub(super) fn substruct_layout(
        &mut self,
        id: usize,
        fields: &[Field],
    ) -> Result<StructLayout, CompileError> {
        if let Some(layout) = self.substruct_layouts.get(&id) {
            return Ok(layout.clone());
        }

        let layout = self.calculate_struct(fields)?;
        self.substruct_layouts.insert(id, layout.clone());
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_of(members: &[(Type, &str)]) -> StructLayout {
        let members: Vec<Field> = members
            .iter()
            .map(|(ty, name)| (ty.clone(), name.to_string()))
            .collect();
        Generator::new().calculate_struct(&members).unwrap()
    }

    #[test]
    fn test_mixed_width_struct_layout() {
        let layout = layout_of(&[
            (Type::U8, "a"),
            (Type::U32, "b"),
            (Type::U8, "c"),
        ]);
        assert_eq!(layout.fields["a"].offset, 0);
        assert_eq!(layout.fields["b"].offset, 4);
        assert_eq!(layout.fields["c"].offset, 8);
        assert_eq!(layout.size, 12);
        assert_eq!(layout.largest, 4);
    }

    #[test]
    fn test_offsets_are_multiples_of_field_alignment() {
        let layout = layout_of(&[
            (Type::U8, "a"),
            (Type::U16, "b"),
            (Type::U64, "c"),
            (Type::U8, "d"),
            (Type::U32, "e"),
        ]);
        for (name, info) in &layout.fields {
            let align = info.ty.size();
            assert_eq!(info.offset % align, 0, "field {} misaligned", name);
        }
        assert_eq!(layout.size % layout.largest, 0);
    }

    #[test]
    fn test_pointer_fields_align_to_eight() {
        let layout = layout_of(&[(Type::U8, "tag"), (Type::Ptr(None), "next")]);
        assert_eq!(layout.fields["next"].offset, 8);
        assert_eq!(layout.size, 16);
    }

    #[test]
    fn test_array_field_uses_element_alignment() {
        let layout = layout_of(&[
            (Type::U8, "tag"),
            (
                Type::Array {
                    element: Box::new(Type::U32),
                    count: 3,
                },
                "items",
            ),
        ]);
        assert_eq!(layout.fields["items"].offset, 4);
        assert_eq!(layout.fields["items"].size, 12);
        assert_eq!(layout.size, 16);
    }

    #[test]
    fn test_sub_struct_field_is_laid_out_recursively() {
        let mut generator = Generator::new();
        let inner = vec![(Type::U8, "x".to_string()), (Type::U64, "y".to_string())];
        let members = vec![
            (Type::U32, "head".to_string()),
            (
                Type::SubStruct {
                    id: 0,
                    fields: inner.clone(),
                },
                "body".to_string(),
            ),
        ];
        let layout = generator.calculate_struct(&members).unwrap();

        // Inner struct: x at 0, y padded to 8, total 16, widest 8.
        let cached = generator.substruct_layout(0, &inner).unwrap();
        assert_eq!(cached.fields["y"].offset, 8);
        assert_eq!(cached.size, 16);

        assert_eq!(layout.fields["body"].size, 16);
        assert_eq!(layout.largest, 8);
        assert_eq!(layout.size % 8, 0);
    }

    #[test]
    fn test_single_byte_struct() {
        let layout = layout_of(&[(Type::U8, "only")]);
        assert_eq!(layout.size, 1);
        assert_eq!(layout.largest, 1);
    }
}
