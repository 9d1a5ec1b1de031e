//! Header tables written by the builder parse back with the same identities

use op_format::{
    DependencyKind, Layout, PackageBuilder, PackageFlags, PackageGuid, PackageHeader, PackageIndex,
};

fn build_chain(exports: usize, chain_depth: usize, layout: Layout) -> (PackageBuilder, Vec<u8>) {
    let mut b = PackageBuilder::new("/Game/Chain").with_guid(PackageGuid([3; 16]));
    let class = b.import_class("/Script/Core", "Blob");
    let mut previous = PackageIndex::NULL;
    for i in 0..exports {
        let outer = if i % 5 == 4 { previous } else { PackageIndex::NULL };
        let export = b.add_export(&format!("Obj{}", i), class, outer, vec![i as u8; i + 1]);
        if chain_depth > 0 && i % (chain_depth + 1) != 0 {
            b.add_dependency(export, DependencyKind::SerializeBeforeSerialize, previous);
        }
        previous = export;
    }
    let built = b.build(layout);
    (b, built.header)
}

#[test]
fn test_roundtrip_identity_triples() {
    for exports in [0usize, 1, 50] {
        for depth in [0usize, 3] {
            let (_, header_bytes) = build_chain(exports, depth, Layout::Split);
            let header = PackageHeader::parse(&header_bytes).unwrap();
            assert_eq!(header.exports.len(), exports);
            for (i, export) in header.exports.iter().enumerate() {
                assert_eq!(export.object_name, format!("Obj{}", i));
                assert_eq!(export.class, PackageIndex::import(1));
                let expected_outer = if i % 5 == 4 {
                    PackageIndex::export(i as u32 - 1)
                } else {
                    PackageIndex::NULL
                };
                assert_eq!(export.outer, expected_outer);
                assert_eq!(export.serial_size, i as u64 + 1);
            }
            let edges = header.all_dependency_edges();
            if depth == 0 || exports < 2 {
                assert!(edges.is_empty());
            } else {
                assert!(!edges.is_empty());
                assert!(edges.iter().all(|e| e.from == PackageIndex::export(e.to_slot - 1)));
            }
        }
    }
}

#[test]
fn test_combined_layout_contains_bodies() {
    let (_, bytes) = build_chain(3, 0, Layout::Combined);
    let header = PackageHeader::parse(&bytes).unwrap();
    assert!(!header.summary.flags.contains(PackageFlags::SPLIT_BODY));
    for (i, export) in header.exports.iter().enumerate() {
        let start = export.serial_offset as usize;
        let end = start + export.serial_size as usize;
        assert!(bytes[start..end].iter().all(|b| *b == i as u8));
    }
}

#[test]
fn test_truncated_header_is_rejected() {
    let (_, bytes) = build_chain(4, 3, Layout::Split);
    let cut = &bytes[..bytes.len() - 3];
    assert!(PackageHeader::parse(cut).is_err());
}

#[test]
fn test_header_serializes_to_json() {
    let (_, bytes) = build_chain(2, 0, Layout::Split);
    let header = PackageHeader::parse(&bytes).unwrap();
    let json = serde_json::to_value(&header).unwrap();
    assert_eq!(json["summary"]["saved_name"], "/Game/Chain");
    assert_eq!(json["exports"][1]["object_name"], "Obj1");
    assert_eq!(json["summary"]["guid"], PackageGuid([3; 16]).to_hex());
}
