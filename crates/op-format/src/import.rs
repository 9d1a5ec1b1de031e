//! Import table entries

use crate::bytes::{ByteReader, ByteWriter};
use crate::index::PackageIndex;
use op_core::error::FormatError;
use serde::Serialize;

/// Package holding the built-in object classes
pub const CORE_SCRIPT_PACKAGE: &str = "/Script/CoreUObject";

/// Class name of package objects
pub const PACKAGE_CLASS: &str = "Package";

/// Class name of class objects
pub const CLASS_CLASS: &str = "Class";

/// Prefix of natively registered (statically linked) packages
pub const SCRIPT_PREFIX: &str = "/Script/";

/// A reference from this package to an object defined elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportEntry {
    pub class_package: String,
    pub class_name: String,
    pub outer: PackageIndex,
    pub object_name: String,
    /// Package the object lives in, when it differs from the outer chain's root
    pub package_name: Option<String>,
}

impl ImportEntry {
    /// Import of a whole package
    pub fn package(name: &str) -> Self {
        Self {
            class_package: CORE_SCRIPT_PACKAGE.to_string(),
            class_name: PACKAGE_CLASS.to_string(),
            outer: PackageIndex::NULL,
            object_name: name.to_string(),
            package_name: None,
        }
    }

    /// Import of a class object living in `outer`
    pub fn class(outer: PackageIndex, name: &str) -> Self {
        Self {
            class_package: CORE_SCRIPT_PACKAGE.to_string(),
            class_name: CLASS_CLASS.to_string(),
            outer,
            object_name: name.to_string(),
            package_name: None,
        }
    }

    /// Import of an object of class `class_package.class_name` living in `outer`
    pub fn object(outer: PackageIndex, class_package: &str, class_name: &str, name: &str) -> Self {
        Self {
            class_package: class_package.to_string(),
            class_name: class_name.to_string(),
            outer,
            object_name: name.to_string(),
            package_name: None,
        }
    }

    pub fn is_package(&self) -> bool {
        self.outer.is_null() && self.class_name == PACKAGE_CLASS
    }

    pub(crate) fn read(r: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let class_package = r.read_string()?;
        let class_name = r.read_string()?;
        let outer = PackageIndex::from_raw(r.read_i32()?);
        let object_name = r.read_string()?;
        let package_name = match r.read_u8()? {
            0 => None,
            _ => Some(r.read_string()?),
        };
        Ok(Self {
            class_package,
            class_name,
            outer,
            object_name,
            package_name,
        })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) {
        w.write_string(&self.class_package);
        w.write_string(&self.class_name);
        w.write_i32(self.outer.raw());
        w.write_string(&self.object_name);
        match &self.package_name {
            Some(name) => {
                w.write_u8(1);
                w.write_string(name);
            }
            None => w.write_u8(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_roundtrip_with_package_name() {
        let mut entry = ImportEntry::object(PackageIndex::import(0), "/Script/Engine", "Mesh", "Rock");
        entry.package_name = Some("/Game/External".to_string());
        let mut w = ByteWriter::new();
        entry.write(&mut w);
        let data = w.into_inner();
        let parsed = ImportEntry::read(&mut ByteReader::new(&data)).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_is_package() {
        assert!(ImportEntry::package("/Game/B").is_package());
        assert!(!ImportEntry::class(PackageIndex::import(0), "Mesh").is_package());
    }
}
