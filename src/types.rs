use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GcError, Result};
use crate::object::{HEADER_SIZE, WORD};
use crate::utils::align_up;

pub type TypeId = u64;

pub type TypeTable = HashMap<TypeId, Arc<TypeDesc>, ahash::RandomState>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    Class,
    Struct,
}

/// Field kinds form a closed set; scanning and layout match on them
/// exhaustively. A `Struct` field embeds another (already laid out)
/// descriptor by value.
#[derive(Clone, Debug)]
pub enum FieldKind {
    Int32,
    Long,
    Decimal,
    Ref,
    Struct(Arc<TypeDesc>),
}

#[derive(Clone, Debug)]
pub struct FieldDesc {
    pub name: String,
    pub kind: FieldKind,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            offset: 0,
            size: 0,
            align: 0,
        }
    }
}

/// A stable per-process type identity. `id` is assigned at registration;
/// layout is computed once and frozen.
#[derive(Clone, Debug)]
pub struct TypeDesc {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub fields: Vec<FieldDesc>,
    pub size: usize,
    pub align: usize,
    /// Payload-relative offsets of every reference slot, nested struct
    /// fields included. Filled by layout.
    ref_offsets: Vec<usize>,
    laid_out: bool,
}

impl TypeDesc {
    pub fn class(name: impl Into<String>, fields: Vec<FieldDesc>) -> Self {
        Self::new(name, TypeKind::Class, fields)
    }

    pub fn value_struct(name: impl Into<String>, fields: Vec<FieldDesc>) -> Self {
        Self::new(name, TypeKind::Struct, fields)
    }

    fn new(name: impl Into<String>, kind: TypeKind, fields: Vec<FieldDesc>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind,
            fields,
            size: 0,
            align: 0,
            ref_offsets: Vec::new(),
            laid_out: false,
        }
    }

    pub fn is_class(&self) -> bool {
        self.kind == TypeKind::Class
    }

    pub fn is_laid_out(&self) -> bool {
        self.laid_out
    }

    /// Places fields in declaration order, each at the next offset
    /// satisfying its alignment. Idempotent: a laid-out descriptor is left
    /// untouched. Embedded struct descriptors must already be laid out
    /// (they are, whenever they came from type registration).
    pub fn compute_layout(&mut self) -> Result<()> {
        if self.laid_out {
            return Ok(());
        }
        let mut cursor = 0usize;
        let mut max_align = 1usize;
        for field in &mut self.fields {
            let (size, align) = match &field.kind {
                FieldKind::Int32 => (4, 4),
                FieldKind::Long => (8, WORD),
                FieldKind::Decimal => (16, 4),
                FieldKind::Ref => (WORD, WORD),
                FieldKind::Struct(inner) => {
                    if !inner.laid_out {
                        return Err(GcError::bad_argument(format!(
                            "struct field `{}` embeds unregistered type `{}`",
                            field.name, inner.name
                        )));
                    }
                    (inner.size, inner.align)
                }
            };
            cursor = align_up(cursor, align);
            field.offset = cursor;
            field.size = size;
            field.align = align;
            cursor += size;
            max_align = max_align.max(align);
        }
        self.align = max_align;
        self.size = match self.kind {
            // A class payload ends at the cursor; object totals are rounded
            // to the word by the allocator, not here.
            TypeKind::Class => cursor,
            // A struct is rounded to its own alignment so arrays of it keep
            // every element aligned. An otherwise-empty struct occupies one
            // byte.
            TypeKind::Struct => {
                if self.fields.is_empty() {
                    1
                } else {
                    align_up(cursor, max_align)
                }
            }
        };
        let mut offsets = Vec::new();
        collect_ref_offsets(&self.fields, 0, &mut offsets);
        self.ref_offsets = offsets;
        self.laid_out = true;
        Ok(())
    }

    /// Total heap footprint of one instance, header included.
    pub fn allocation_size(&self) -> usize {
        align_up(HEADER_SIZE + self.size, WORD)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn ref_offsets(&self) -> &[usize] {
        &self.ref_offsets
    }
}

fn collect_ref_offsets(fields: &[FieldDesc], base: usize, out: &mut Vec<usize>) {
    for field in fields {
        match &field.kind {
            FieldKind::Ref => out.push(base + field.offset),
            FieldKind::Struct(inner) => {
                collect_ref_offsets(&inner.fields, base + field.offset, out)
            }
            _ => {}
        }
    }
}
