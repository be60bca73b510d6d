// (C) 2020 Brandon Lewis
//
// The type registry.
//
// Every value the machine touches starts with an inline `Type` tag: a
// plain-old-data pair of a numeric type code and the full object size
// in bytes. The tag is what makes the raw byte stack self-describing:
// reading eight bytes at the top of the stack tells you what is there
// and how big it is, without consulting anything else.
//
// Fundamental types (int, long, double, pointer, gcpointer) are
// process-wide constants. User structure layouts are owned by the
// program image's structure table; their codes start at 10. Code 6
// (array) only ever modifies another type and is not itself storable
// in a slot.

use std::collections::HashMap;
use std::fmt;
use std::mem;

use enumflags2::BitFlags;

use crate::object::{
    ArrayObject,
    DoubleObject,
    GCPointerObject,
    IntObject,
    LongObject,
    PointerObject,
};


// Numeric type codes as they appear in bytecode operands. The code
// space is open-ended: structure codes are 10 + table index.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeCode(pub u32);

impl TypeCode {
    pub const NONE: TypeCode = TypeCode(0);
    pub const INT: TypeCode = TypeCode(1);
    pub const LONG: TypeCode = TypeCode(2);
    pub const DOUBLE: TypeCode = TypeCode(3);
    pub const POINTER: TypeCode = TypeCode(4);
    pub const GC_POINTER: TypeCode = TypeCode(5);
    pub const ARRAY: TypeCode = TypeCode(6);

    // Codes 7 through 9 are reserved.
    pub const STRUCTURE_BASE: u32 = 10;

    pub fn structure(index: usize) -> TypeCode {
        TypeCode(TypeCode::STRUCTURE_BASE + index as u32)
    }

    pub fn is_fundamental(self) -> bool {
        self.0 >= TypeCode::INT.0 && self.0 <= TypeCode::GC_POINTER.0
    }

    pub fn is_structure(self) -> bool {
        self.0 >= TypeCode::STRUCTURE_BASE
    }

    pub fn structure_index(self) -> Option<usize> {
        if self.is_structure() {
            Some((self.0 - TypeCode::STRUCTURE_BASE) as usize)
        } else {
            None
        }
    }

    pub fn class(self) -> Option<TypeClass> {
        match self {
            TypeCode::INT => Some(TypeClass::Int),
            TypeCode::LONG => Some(TypeClass::Long),
            TypeCode::DOUBLE => Some(TypeClass::Double),
            TypeCode::POINTER => Some(TypeClass::Pointer),
            TypeCode::GC_POINTER => Some(TypeClass::GCPointer),
            _ => None,
        }
    }
}


// Classes of fundamental values, for validating instruction operand
// domains as sets.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TypeClass {
    Int       = 0b00001,
    Long      = 0b00010,
    Double    = 0b00100,
    Pointer   = 0b01000,
    GCPointer = 0b10000,
}

pub type TypeSet = BitFlags<TypeClass>;

// Operand domains shared by the interpreter's validation paths.
pub fn arithmetic() -> TypeSet {
    TypeClass::Int | TypeClass::Long | TypeClass::Double
}

pub fn pointers() -> TypeSet {
    TypeClass::Pointer | TypeClass::GCPointer
}


// The inline tag. Occupies the leading eight bytes of every stack or
// heap object. `size` is the size of the whole tagged object,
// including the tag itself and, for structures, every field.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Type {
    pub code: TypeCode,
    pub size: u32,
}

pub const NONE_TYPE: Type = Type { code: TypeCode::NONE, size: 0 };
pub const INT_TYPE: Type = Type {
    code: TypeCode::INT,
    size: mem::size_of::<IntObject>() as u32,
};
pub const LONG_TYPE: Type = Type {
    code: TypeCode::LONG,
    size: mem::size_of::<LongObject>() as u32,
};
pub const DOUBLE_TYPE: Type = Type {
    code: TypeCode::DOUBLE,
    size: mem::size_of::<DoubleObject>() as u32,
};
pub const POINTER_TYPE: Type = Type {
    code: TypeCode::POINTER,
    size: mem::size_of::<PointerObject>() as u32,
};
pub const GC_POINTER_TYPE: Type = Type {
    code: TypeCode::GC_POINTER,
    size: mem::size_of::<GCPointerObject>() as u32,
};

// Array is a modifier: the header below is the only object shape it
// ever takes, and it never occupies a stack slot on its own.
pub const ARRAY_TYPE: Type = Type {
    code: TypeCode::ARRAY,
    size: mem::size_of::<ArrayObject>() as u32,
};

impl Type {
    pub fn is_fundamental(&self) -> bool {
        self.code.is_fundamental()
    }

    pub fn is_structure(&self) -> bool {
        self.code.is_structure()
    }

    pub fn is_none(&self) -> bool {
        self.code == TypeCode::NONE
    }

    pub fn name(&self) -> String {
        if let Some(desc) = fundamental(self.code) {
            String::from(desc.name)
        } else if let Some(index) = self.code.structure_index() {
            format!("structure{}", index)
        } else if self.code == TypeCode::ARRAY {
            String::from("array")
        } else {
            String::from("none")
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub fn fundamental_type(code: TypeCode) -> Option<Type> {
    match code {
        TypeCode::INT => Some(INT_TYPE),
        TypeCode::LONG => Some(LONG_TYPE),
        TypeCode::DOUBLE => Some(DOUBLE_TYPE),
        TypeCode::POINTER => Some(POINTER_TYPE),
        TypeCode::GC_POINTER => Some(GC_POINTER_TYPE),
        _ => None,
    }
}


// Registry-side description of a fundamental type.
#[derive(Debug)]
pub struct TypeDesc {
    pub code: TypeCode,
    pub size: u32,
    pub alignment: u32,
    pub name: &'static str,
}

lazy_static! {
    static ref FUNDAMENTALS: HashMap<TypeCode, TypeDesc> = {
        let mut table = HashMap::new();
        let descs = [
            (TypeCode::INT, INT_TYPE.size,
             mem::align_of::<IntObject>() as u32, "int"),
            (TypeCode::LONG, LONG_TYPE.size,
             mem::align_of::<LongObject>() as u32, "long"),
            (TypeCode::DOUBLE, DOUBLE_TYPE.size,
             mem::align_of::<DoubleObject>() as u32, "double"),
            (TypeCode::POINTER, POINTER_TYPE.size,
             mem::align_of::<PointerObject>() as u32, "pointer"),
            (TypeCode::GC_POINTER, GC_POINTER_TYPE.size,
             mem::align_of::<GCPointerObject>() as u32, "gcpointer"),
        ];
        for &(code, size, alignment, name) in descs.iter() {
            table.insert(code, TypeDesc { code, size, alignment, name });
        }
        table
    };
}

pub fn fundamental(code: TypeCode) -> Option<&'static TypeDesc> {
    FUNDAMENTALS.get(&code)
}


// One field of a structure layout. The offset is from the start of
// the outer object, so the field's own tag lands at exactly that
// offset.
#[derive(Clone, Debug)]
pub struct Field {
    pub ty: Type,
    pub offset: u32,
}

#[derive(Clone, Debug)]
pub struct StructureInfo {
    pub name: String,
    pub ty: Type,
    pub alignment: u32,
    pub fields: Vec<Field>,
}

// The program image's table of user structure layouts, indexed by
// structure codes minus 10.
#[derive(Clone, Debug, Default)]
pub struct Structures {
    infos: Vec<StructureInfo>,
}

pub type DefineResult = std::result::Result<TypeCode, String>;

impl Structures {
    pub fn new() -> Structures {
        Structures { infos: Vec::new() }
    }

    // Lays out a new structure from its field type codes and returns
    // the code assigned to it. Field codes must name fundamental
    // types or structures already in the table.
    pub fn define(&mut self, name: &str, field_codes: &[TypeCode]) -> DefineResult {
        let mut fields = Vec::with_capacity(field_codes.len());
        let mut offset = mem::size_of::<Type>() as u32;
        let mut alignment = mem::align_of::<Type>() as u32;

        for &code in field_codes {
            let (ty, field_alignment) = self.field_layout(code).ok_or_else(|| {
                format!("unknown field type code {:?} in {}", code, name)
            })?;
            offset = round_up(offset, field_alignment);
            fields.push(Field { ty, offset });
            offset += ty.size;
            alignment = alignment.max(field_alignment);
        }

        let size = round_up(offset, alignment);
        let code = TypeCode::structure(self.infos.len());
        self.infos.push(StructureInfo {
            name: String::from(name),
            ty: Type { code, size },
            alignment,
            fields,
        });
        Ok(code)
    }

    fn field_layout(&self, code: TypeCode) -> Option<(Type, u32)> {
        if let Some(index) = code.structure_index() {
            let info = self.infos.get(index)?;
            return Some((info.ty, info.alignment));
        }
        let desc = fundamental(code)?;
        Some((Type { code, size: desc.size }, desc.alignment))
    }

    pub fn count(&self) -> usize {
        self.infos.len()
    }

    pub fn get(&self, index: usize) -> Option<&StructureInfo> {
        self.infos.get(index)
    }

    // Resolves a bytecode type operand: fundamental codes 1 through 5,
    // or 10 + i for the i-th structure.
    pub fn type_from_code(&self, code: TypeCode) -> Option<Type> {
        if let Some(index) = code.structure_index() {
            return self.get(index).map(|info| info.ty);
        }
        fundamental_type(code)
    }
}

fn round_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_eight_bytes() {
        assert_eq!(mem::size_of::<Type>(), 8);
    }

    #[test]
    fn test_fundamental_sizes() {
        assert_eq!(INT_TYPE.size, 12);
        assert_eq!(LONG_TYPE.size, 16);
        assert_eq!(DOUBLE_TYPE.size, 16);
        assert_eq!(POINTER_TYPE.size, mem::size_of::<PointerObject>() as u32);
    }

    #[test]
    fn test_code_classification() {
        assert!(TypeCode::INT.is_fundamental());
        assert!(!TypeCode::INT.is_structure());
        assert!(TypeCode(10).is_structure());
        assert_eq!(TypeCode(12).structure_index(), Some(2));
        assert_eq!(TypeCode::ARRAY.class(), None);
        assert!(arithmetic().contains(TypeClass::Double));
        assert!(!arithmetic().contains(TypeClass::Pointer));
        assert!(pointers().contains(TypeClass::GCPointer));
    }

    #[test]
    fn test_structure_layout() {
        let mut structures = Structures::new();
        let code = structures
            .define("pair", &[TypeCode::INT, TypeCode::LONG])
            .unwrap();
        assert_eq!(code, TypeCode(10));

        let info = structures.get(0).unwrap();
        assert_eq!(info.fields[0].offset, 8);
        assert_eq!(info.fields[1].offset, 24);
        assert_eq!(info.ty.size, 40);
        assert_eq!(info.alignment, 8);
    }

    #[test]
    fn test_nested_structure_layout() {
        let mut structures = Structures::new();
        let inner = structures
            .define("pair", &[TypeCode::INT, TypeCode::LONG])
            .unwrap();
        let outer = structures.define("wrap", &[inner, TypeCode::INT]).unwrap();

        let info = structures.get(outer.structure_index().unwrap()).unwrap();
        assert_eq!(info.fields[0].offset, 8);
        assert_eq!(info.fields[1].offset, 48);
        assert_eq!(info.ty.size, 64);
    }

    #[test]
    fn test_unknown_field_code_is_rejected() {
        let mut structures = Structures::new();
        assert!(structures.define("bad", &[TypeCode(7)]).is_err());
        assert!(structures.define("bad", &[TypeCode(11)]).is_err());
        assert!(structures.define("bad", &[TypeCode::ARRAY]).is_err());
    }

    #[test]
    fn test_type_from_code() {
        let mut structures = Structures::new();
        structures.define("pair", &[TypeCode::INT]).unwrap();

        assert_eq!(structures.type_from_code(TypeCode::INT), Some(INT_TYPE));
        assert_eq!(structures.type_from_code(TypeCode::NONE), None);
        assert_eq!(structures.type_from_code(TypeCode(9)), None);
        assert!(structures.type_from_code(TypeCode(10)).is_some());
        assert_eq!(structures.type_from_code(TypeCode(11)), None);
    }
}
