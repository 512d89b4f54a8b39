//! Integration tests for descriptor parsing.

use vmdkread_core::vmdk::{Descriptor, ExtentType};

const SPLIT_SPARSE_DESCRIPTOR: &str = r#"
# Disk DescriptorFile
version=1
CID=7ad2c9b1
parentCID=ffffffff
createType="twoGbMaxExtentSparse"

# Extent description
RW 4192256 SPARSE "TestVM-s001.vmdk"
RW 4192256 SPARSE "TestVM-s002.vmdk"
RW 2048 SPARSE "TestVM-s003.vmdk"

# The Disk Data Base
ddb.virtualHWVersion = "21"
ddb.geometry.cylinders = "520"
ddb.geometry.heads = "255"
ddb.geometry.sectors = "63"
ddb.adapterType = "lsilogic"
"#;

const MONOLITHIC_FLAT_DESCRIPTOR: &str = r#"
# Disk DescriptorFile
version=1
CID=fffffffe
parentCID=0a1b2c3d
createType="monolithicFlat"

RW 838860800 FLAT "TestVM-flat.vmdk" 0
"#;

#[test]
fn test_parse_split_sparse_extents() {
    let descriptor =
        Descriptor::parse(SPLIT_SPARSE_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.create_type, "twoGbMaxExtentSparse");
    assert_eq!(descriptor.extents.len(), 3);
    for extent in &descriptor.extents {
        assert_eq!(extent.extent_type, ExtentType::Sparse);
        assert_eq!(extent.offset, 0);
    }
    assert_eq!(descriptor.extents[2].filename, "TestVM-s003.vmdk");
}

#[test]
fn test_parse_geometry() {
    let descriptor =
        Descriptor::parse(SPLIT_SPARSE_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.cylinders, 520);
    assert_eq!(descriptor.heads, 255);
    assert_eq!(descriptor.sectors, 63);
    assert_eq!(descriptor.adapter_type, "lsilogic");
}

#[test]
fn test_media_size() {
    let descriptor =
        Descriptor::parse(SPLIT_SPARSE_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.media_size().unwrap(), (4192256 * 2 + 2048) * 512);
}

#[test]
fn test_parent_cid() {
    let descriptor =
        Descriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");

    assert_eq!(descriptor.cid, 0xfffffffe);
    assert_eq!(descriptor.parent_cid, 0x0a1b2c3d);
    assert!(descriptor.has_parent());
}

#[test]
fn test_find_flat_extent_by_path() {
    let descriptor =
        Descriptor::parse(MONOLITHIC_FLAT_DESCRIPTOR).expect("Failed to parse descriptor");

    let extent = descriptor
        .find_extent("/vms/TestVM/TestVM-flat.vmdk")
        .expect("extent should match by file name");
    assert!(extent.extent_type.is_raw_data());
    assert_eq!(extent.size_bytes().unwrap(), 838860800 * 512);
    assert!(descriptor.find_extent("/vms/TestVM/Other-flat.vmdk").is_none());
}

#[test]
fn test_malformed_extent_line() {
    let result = Descriptor::parse("RW abc SPARSE \"disk.vmdk\"\n");
    assert!(result.is_err());
}
