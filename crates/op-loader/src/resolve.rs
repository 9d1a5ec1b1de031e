//! Import/export identity resolution
//!
//! Objects are identified by their full path: the outer chain joined with
//! `.` under the package name. Paths are built iteratively with memoization,
//! so adversarial outer chains cost no stack and every entry is visited once.

use crate::object::child_path;
use op_format::{ImportEntry, ObjectSlot, PackageHeader, PackageIndex, CLASS_CLASS, SCRIPT_PREFIX};
use std::collections::HashMap;
use tracing::warn;

/// Resolved identity of one import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportIdentity {
    /// Full object path
    pub path: String,
    /// Package the object lives in
    pub package: String,
    pub class_name: String,
    /// The import names a whole package
    pub is_package: bool,
}

impl ImportIdentity {
    /// Natively registered objects are never loaded from disk
    pub fn is_script(&self) -> bool {
        self.package.starts_with(SCRIPT_PREFIX)
    }
}

/// Build the identity of every import of `header`
pub fn import_identities(header: &PackageHeader) -> Vec<ImportIdentity> {
    let count = header.imports.len();
    let mut resolved: Vec<Option<(String, String)>> = vec![None; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();

    for start in 0..count {
        if resolved[start].is_some() {
            continue;
        }
        stack.push(start);
        on_stack[start] = true;
        while let Some(&slot) = stack.last() {
            let entry = &header.imports[slot];
            let outer = match entry.outer.resolve() {
                ObjectSlot::Import(o) => Some(o as usize),
                ObjectSlot::Null => None,
                ObjectSlot::Export(_) => {
                    warn!(
                        "Import {} of {} has an export outer, treating as top level",
                        entry.object_name, header.summary.saved_name
                    );
                    None
                }
            };
            let identity = match outer {
                None => Some(top_level_import(entry)),
                Some(o) if resolved[o].is_some() => resolved[o]
                    .as_ref()
                    .map(|(path, package)| nested_import(entry, path, package)),
                Some(o) if on_stack[o] => {
                    warn!(
                        "Import outer chain of {} in {} loops, treating as top level",
                        entry.object_name, header.summary.saved_name
                    );
                    Some(top_level_import(entry))
                }
                Some(o) => {
                    stack.push(o);
                    on_stack[o] = true;
                    None
                }
            };
            if let Some(identity) = identity {
                resolved[slot] = Some(identity);
                on_stack[slot] = false;
                stack.pop();
            }
        }
    }

    header
        .imports
        .iter()
        .zip(resolved)
        .map(|(entry, resolved)| {
            let (path, package) = resolved.unwrap_or_default();
            ImportIdentity {
                path,
                package,
                class_name: entry.class_name.clone(),
                is_package: entry.is_package(),
            }
        })
        .collect()
}

fn top_level_import(entry: &ImportEntry) -> (String, String) {
    match &entry.package_name {
        Some(package) if !entry.is_package() => {
            (child_path(package, &entry.object_name), package.clone())
        }
        _ => (entry.object_name.clone(), entry.object_name.clone()),
    }
}

fn nested_import(entry: &ImportEntry, outer_path: &str, outer_package: &str) -> (String, String) {
    let package = entry
        .package_name
        .clone()
        .unwrap_or_else(|| outer_package.to_string());
    (child_path(outer_path, &entry.object_name), package)
}

/// Build the full path of every export of `package`.
///
/// `imports` supplies paths for exports nested under imported outers.
pub fn export_paths(package: &str, header: &PackageHeader, imports: &[ImportIdentity]) -> Vec<String> {
    let count = header.exports.len();
    let mut resolved: Vec<Option<String>> = vec![None; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();

    for start in 0..count {
        if resolved[start].is_some() {
            continue;
        }
        stack.push(start);
        on_stack[start] = true;
        while let Some(&slot) = stack.last() {
            let entry = &header.exports[slot];
            let path = match entry.outer.resolve() {
                ObjectSlot::Null => Some(child_path(package, &entry.object_name)),
                ObjectSlot::Import(i) => {
                    let outer = imports
                        .get(i as usize)
                        .map_or(package, |identity| identity.path.as_str());
                    Some(child_path(outer, &entry.object_name))
                }
                ObjectSlot::Export(o) => {
                    let o = o as usize;
                    if let Some(outer) = &resolved[o] {
                        Some(child_path(outer, &entry.object_name))
                    } else if on_stack[o] {
                        warn!(
                            "Export outer chain of {} in {} loops, treating as top level",
                            entry.object_name, package
                        );
                        Some(child_path(package, &entry.object_name))
                    } else {
                        stack.push(o);
                        on_stack[o] = true;
                        None
                    }
                }
            };
            if let Some(path) = path {
                resolved[slot] = Some(path);
                on_stack[slot] = false;
                stack.pop();
            }
        }
    }

    resolved.into_iter().map(Option::unwrap_or_default).collect()
}

/// Path to slot cache built while exports are registered
#[derive(Debug, Default, Clone)]
pub struct ExportLookup {
    slots: HashMap<String, u32>,
}

impl ExportLookup {
    pub fn new(paths: &[String]) -> Self {
        let mut slots = HashMap::with_capacity(paths.len());
        for (slot, path) in paths.iter().enumerate() {
            if slots.insert(path.clone(), slot as u32).is_some() {
                warn!("Duplicate export path {}", path);
            }
        }
        Self { slots }
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.slots.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Find the export of `header` matching `import`, comparing path and class
    pub fn find_import(&self, header: &PackageHeader, import: &ImportIdentity) -> Option<u32> {
        let slot = self.get(&import.path)?;
        let export = header.exports.get(slot as usize)?;
        let class = class_short_name(header, export.class);
        let matches = match class {
            Some(class) => class == import.class_name,
            None => false,
        } || (import.class_name == CLASS_CLASS && !export.super_ref.is_null());
        if matches {
            Some(slot)
        } else {
            warn!(
                "Import {} expects class {} but the export has class {:?}",
                import.path, import.class_name, class
            );
            None
        }
    }
}

/// Short name of the class referenced by `index`
pub fn class_short_name(header: &PackageHeader, index: PackageIndex) -> Option<&str> {
    match index.resolve() {
        ObjectSlot::Import(i) => header.imports.get(i as usize).map(|e| e.object_name.as_str()),
        ObjectSlot::Export(e) => header.exports.get(e as usize).map(|e| e.object_name.as_str()),
        ObjectSlot::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_format::{Layout, PackageBuilder};

    fn parse(builder: &PackageBuilder) -> PackageHeader {
        PackageHeader::parse(&builder.build(Layout::Combined).header).unwrap()
    }

    #[test]
    fn test_import_identities() {
        let mut b = PackageBuilder::new("/Game/A");
        let class = b.import_class("/Script/Engine", "Mesh");
        let bar = b.import_object("/Game/B", "/Script/Engine", "Mesh", "Bar");
        let inner = b.import_nested(bar, "/Script/Engine", "Mesh", "Inner");
        b.add_export("Foo", class, PackageIndex::NULL, vec![]);
        let header = parse(&b);
        let ids = import_identities(&header);

        let class = &ids[class.as_import().unwrap() as usize];
        assert_eq!(class.path, "/Script/Engine.Mesh");
        assert!(class.is_script());

        let bar = &ids[bar.as_import().unwrap() as usize];
        assert_eq!(bar.path, "/Game/B.Bar");
        assert_eq!(bar.package, "/Game/B");
        assert!(!bar.is_package);

        let inner = &ids[inner.as_import().unwrap() as usize];
        assert_eq!(inner.path, "/Game/B.Bar.Inner");
        assert_eq!(inner.package, "/Game/B");

        let package = ids.iter().find(|i| i.path == "/Game/B").unwrap();
        assert!(package.is_package);
    }

    #[test]
    fn test_export_paths_nested() {
        let mut b = PackageBuilder::new("/Game/A");
        let class = b.import_class("/Script/Engine", "Mesh");
        let root = b.add_export("Root", class, PackageIndex::NULL, vec![]);
        let child = b.add_export("Child", class, root, vec![]);
        b.add_export("Leaf", class, child, vec![]);
        let header = parse(&b);
        let paths = export_paths("/Game/A", &header, &import_identities(&header));
        assert_eq!(paths, vec!["/Game/A.Root", "/Game/A.Root.Child", "/Game/A.Root.Child.Leaf"]);
    }

    #[test]
    fn test_deep_outer_chain_is_iterative() {
        let mut b = PackageBuilder::new("/Game/Deep");
        let class = b.import_class("/Script/Engine", "Mesh");
        // Children before parents forces the explicit stack to unwind the whole chain.
        let depth = 10_000u32;
        for i in 0..depth {
            let outer = if i + 1 < depth {
                PackageIndex::export(i + 1)
            } else {
                PackageIndex::NULL
            };
            b.add_export(&format!("N{}", i), class, outer, vec![]);
        }
        let header = parse(&b);
        let paths = export_paths("/Game/Deep", &header, &import_identities(&header));
        assert_eq!(paths[(depth - 1) as usize], format!("/Game/Deep.N{}", depth - 1));
        assert!(paths[0].ends_with(".N1.N0"));
        assert_eq!(paths[0].matches('.').count(), depth as usize);
    }

    #[test]
    fn test_find_import_checks_class() {
        let mut b = PackageBuilder::new("/Game/B");
        let mesh = b.import_class("/Script/Engine", "Mesh");
        b.add_export("Bar", mesh, PackageIndex::NULL, vec![1]);
        let header = parse(&b);
        let paths = export_paths("/Game/B", &header, &import_identities(&header));
        let lookup = ExportLookup::new(&paths);

        let good = ImportIdentity {
            path: "/Game/B.Bar".to_string(),
            package: "/Game/B".to_string(),
            class_name: "Mesh".to_string(),
            is_package: false,
        };
        assert_eq!(lookup.find_import(&header, &good), Some(0));

        let wrong_class = ImportIdentity {
            class_name: "Texture".to_string(),
            ..good.clone()
        };
        assert_eq!(lookup.find_import(&header, &wrong_class), None);

        let absent = ImportIdentity {
            path: "/Game/B.Missing".to_string(),
            ..good
        };
        assert_eq!(lookup.find_import(&header, &absent), None);
    }
}
