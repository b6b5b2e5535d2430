//! Data-type factory for recovered variables.
//!
//! The analysis does not need a full source-level type system; it needs a
//! cheap, interned representation that can answer "what is the basic type of
//! this size and class", "what does this pointer point to", and "what field
//! sits at this byte offset". Types are immutable after interning and are
//! referenced by [`TypeId`] everywhere in the core.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Broad classification of a data-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metatype {
    /// No value.
    Void,
    /// Type not yet recovered; sized but classless.
    Unknown,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    Uint,
    /// Single-byte boolean.
    Bool,
    /// IEEE floating point.
    Float,
    /// Executable code (target of a call or branch).
    Code,
    /// Pointer to another type.
    Pointer,
    /// Array of a uniform element type.
    Array,
    /// Composite with fields at fixed offsets.
    Struct,
}

/// Interned handle to a data-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Returns the index of this type within its factory.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A field of a composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeField {
    /// Byte offset of the field within the composite.
    pub offset: u64,
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: TypeId,
}

/// An interned data-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    name: String,
    size: u64,
    metatype: Metatype,
    /// Pointee for pointers, element for arrays.
    inner: Option<TypeId>,
    /// Element count for arrays.
    count: u64,
    /// Fields for composites, ordered by offset.
    fields: Vec<TypeField>,
}

impl Datatype {
    /// Returns the type's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the metatype classification.
    #[must_use]
    pub const fn metatype(&self) -> Metatype {
        self.metatype
    }

    /// Returns the pointee (pointer) or element (array) type.
    #[must_use]
    pub const fn inner(&self) -> Option<TypeId> {
        self.inner
    }

    /// Returns the fields of a composite type.
    #[must_use]
    pub fn fields(&self) -> &[TypeField] {
        &self.fields
    }

    /// Returns `true` if values of this type hold addresses.
    #[must_use]
    pub const fn is_pointer(&self) -> bool {
        matches!(self.metatype, Metatype::Pointer)
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Sizing and alignment policy derived from the compiler's data organization.
#[derive(Debug, Clone)]
pub struct DataOrganization {
    /// Size of a data pointer in bytes.
    pub pointer_size: u64,
    /// Size of the default integer in bytes.
    pub int_size: u64,
    /// Maximum alignment honored by the compiler.
    pub max_align: u64,
}

impl Default for DataOrganization {
    fn default() -> Self {
        Self {
            pointer_size: 8,
            int_size: 4,
            max_align: 8,
        }
    }
}

/// Factory that interns and resolves data-types.
///
/// Base types are deduplicated by (size, metatype); pointers and arrays by
/// their structure. The factory is built once per architecture and read-only
/// during analysis.
#[derive(Debug)]
pub struct TypeFactory {
    types: Vec<Datatype>,
    base_index: FxHashMap<(u64, Metatype), TypeId>,
    pointer_index: FxHashMap<TypeId, TypeId>,
    organization: DataOrganization,
    void_type: TypeId,
    code_type: TypeId,
}

impl TypeFactory {
    /// Creates a factory seeded with the void and code types.
    #[must_use]
    pub fn new(organization: DataOrganization) -> Self {
        let mut factory = Self {
            types: Vec::new(),
            base_index: FxHashMap::default(),
            pointer_index: FxHashMap::default(),
            organization,
            void_type: TypeId(0),
            code_type: TypeId(0),
        };
        factory.void_type = factory.intern(Datatype {
            name: "void".to_string(),
            size: 0,
            metatype: Metatype::Void,
            inner: None,
            count: 0,
            fields: Vec::new(),
        });
        factory.base_index.insert((0, Metatype::Void), factory.void_type);
        factory.code_type = factory.intern(Datatype {
            name: "code".to_string(),
            size: 1,
            metatype: Metatype::Code,
            inner: None,
            count: 0,
            fields: Vec::new(),
        });
        factory.base_index.insert((1, Metatype::Code), factory.code_type);
        factory
    }

    fn intern(&mut self, ty: Datatype) -> TypeId {
        let id = TypeId(u32::try_from(self.types.len()).unwrap_or(u32::MAX));
        self.types.push(ty);
        id
    }

    fn base_name(size: u64, metatype: Metatype) -> String {
        match metatype {
            Metatype::Void => "void".to_string(),
            Metatype::Unknown => format!("undefined{size}"),
            Metatype::Int => format!("int{}", size * 8),
            Metatype::Uint => format!("uint{}", size * 8),
            Metatype::Bool => "bool".to_string(),
            Metatype::Float => format!("float{}", size * 8),
            Metatype::Code => "code".to_string(),
            Metatype::Pointer => format!("ptr{size}"),
            Metatype::Array => format!("array{size}"),
            Metatype::Struct => format!("struct{size}"),
        }
    }

    /// Returns the base type of the given size and metatype, interning it on
    /// first use.
    pub fn base(&mut self, size: u64, metatype: Metatype) -> TypeId {
        if let Some(&id) = self.base_index.get(&(size, metatype)) {
            return id;
        }
        let ty = Datatype {
            name: Self::base_name(size, metatype),
            size,
            metatype,
            inner: None,
            count: 0,
            fields: Vec::new(),
        };
        let id = self.intern(ty);
        self.base_index.insert((size, metatype), id);
        id
    }

    /// Returns the unique code type.
    #[must_use]
    pub const fn type_code(&self) -> TypeId {
        self.code_type
    }

    /// Returns the void type.
    #[must_use]
    pub const fn type_void(&self) -> TypeId {
        self.void_type
    }

    /// Returns a pointer type to `pointee`, interning it on first use.
    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        if let Some(&id) = self.pointer_index.get(&pointee) {
            return id;
        }
        let name = format!("{} *", self.get(pointee).name());
        let ty = Datatype {
            name,
            size: self.organization.pointer_size,
            metatype: Metatype::Pointer,
            inner: Some(pointee),
            count: 0,
            fields: Vec::new(),
        };
        let id = self.intern(ty);
        self.pointer_index.insert(pointee, id);
        id
    }

    /// Interns a composite type with the given fields.
    pub fn composite(&mut self, name: &str, size: u64, mut fields: Vec<TypeField>) -> TypeId {
        fields.sort_by_key(|f| f.offset);
        self.intern(Datatype {
            name: name.to_string(),
            size,
            metatype: Metatype::Struct,
            inner: None,
            count: 0,
            fields,
        })
    }

    /// Resolves a type handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle did not come from this factory.
    #[must_use]
    pub fn get(&self, id: TypeId) -> &Datatype {
        &self.types[id.index()]
    }

    /// Returns the component type found at a byte offset within `ty`, along
    /// with the remaining offset into that component.
    ///
    /// For composites this is the covering field; for arrays the element.
    /// Returns `None` when the offset falls outside any component.
    #[must_use]
    pub fn subtype_at(&self, ty: TypeId, offset: u64) -> Option<(TypeId, u64)> {
        let dt = self.get(ty);
        match dt.metatype() {
            Metatype::Struct => {
                for field in dt.fields() {
                    let fsize = self.get(field.ty).size();
                    if offset >= field.offset && offset < field.offset + fsize {
                        return Some((field.ty, offset - field.offset));
                    }
                }
                None
            }
            Metatype::Array => {
                let elem = dt.inner()?;
                let esize = self.get(elem).size();
                if esize == 0 || offset >= dt.size() {
                    return None;
                }
                Some((elem, offset % esize))
            }
            _ => None,
        }
    }

    /// Returns the data-organization policy.
    #[must_use]
    pub const fn organization(&self) -> &DataOrganization {
        &self.organization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_types_deduplicate() {
        let mut factory = TypeFactory::new(DataOrganization::default());
        let a = factory.base(4, Metatype::Int);
        let b = factory.base(4, Metatype::Int);
        assert_eq!(a, b);
        let c = factory.base(8, Metatype::Int);
        assert_ne!(a, c);
        assert_eq!(factory.get(a).name(), "int32");
        assert_eq!(factory.get(c).size(), 8);
    }

    #[test]
    fn test_pointer_interning() {
        let mut factory = TypeFactory::new(DataOrganization::default());
        let int4 = factory.base(4, Metatype::Int);
        let p1 = factory.pointer_to(int4);
        let p2 = factory.pointer_to(int4);
        assert_eq!(p1, p2);
        assert_eq!(factory.get(p1).size(), 8);
        assert_eq!(factory.get(p1).inner(), Some(int4));
    }

    #[test]
    fn test_subtype_lookup() {
        let mut factory = TypeFactory::new(DataOrganization::default());
        let int4 = factory.base(4, Metatype::Int);
        let int8 = factory.base(8, Metatype::Uint);
        let composite = factory.composite(
            "pair",
            12,
            vec![
                TypeField {
                    offset: 0,
                    name: "first".to_string(),
                    ty: int4,
                },
                TypeField {
                    offset: 4,
                    name: "second".to_string(),
                    ty: int8,
                },
            ],
        );

        assert_eq!(factory.subtype_at(composite, 0), Some((int4, 0)));
        assert_eq!(factory.subtype_at(composite, 6), Some((int8, 2)));
        assert_eq!(factory.subtype_at(composite, 12), None);
    }

    #[test]
    fn test_code_type() {
        let factory = TypeFactory::new(DataOrganization::default());
        assert_eq!(factory.get(factory.type_code()).metatype(), Metatype::Code);
    }
}
