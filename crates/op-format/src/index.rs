//! Object references inside a package
//!
//! A [`PackageIndex`] is a signed 32-bit value: zero is null, positive values
//! name an export (`value - 1`) and negative values name an import
//! (`-value - 1`).

use serde::Serialize;
use std::fmt;

/// Reference to an import, an export, or nothing
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct PackageIndex(i32);

impl PackageIndex {
    /// The null reference
    pub const NULL: PackageIndex = PackageIndex(0);

    /// Reference to export slot `slot`
    pub fn export(slot: u32) -> Self {
        Self(slot as i32 + 1)
    }

    /// Reference to import slot `slot`
    pub fn import(slot: u32) -> Self {
        Self(-(slot as i32) - 1)
    }

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn is_export(&self) -> bool {
        self.0 > 0
    }

    pub fn is_import(&self) -> bool {
        self.0 < 0
    }

    /// Export slot, if this refers to an export
    pub fn as_export(&self) -> Option<u32> {
        if self.is_export() {
            Some((self.0 - 1) as u32)
        } else {
            None
        }
    }

    /// Import slot, if this refers to an import
    pub fn as_import(&self) -> Option<u32> {
        if self.is_import() {
            Some((-self.0 - 1) as u32)
        } else {
            None
        }
    }

    /// Decoded form
    pub fn resolve(&self) -> ObjectSlot {
        match (self.as_import(), self.as_export()) {
            (Some(i), _) => ObjectSlot::Import(i),
            (_, Some(e)) => ObjectSlot::Export(e),
            _ => ObjectSlot::Null,
        }
    }
}

/// Decoded [`PackageIndex`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectSlot {
    Null,
    Import(u32),
    Export(u32),
}

impl fmt::Debug for PackageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            ObjectSlot::Null => write!(f, "Null"),
            ObjectSlot::Import(i) => write!(f, "Import({})", i),
            ObjectSlot::Export(e) => write!(f, "Export({})", e),
        }
    }
}

impl fmt::Display for PackageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_encoding() {
        assert_eq!(PackageIndex::export(0).raw(), 1);
        assert_eq!(PackageIndex::import(0).raw(), -1);
        assert_eq!(PackageIndex::import(4).as_import(), Some(4));
        assert_eq!(PackageIndex::export(9).as_export(), Some(9));
        assert!(PackageIndex::NULL.is_null());
        assert_eq!(PackageIndex::NULL.resolve(), ObjectSlot::Null);
    }

    #[test]
    fn test_index_display() {
        assert_eq!(format!("{}", PackageIndex::import(2)), "Import(2)");
        assert_eq!(format!("{}", PackageIndex::export(3)), "Export(3)");
    }
}
