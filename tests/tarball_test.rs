//! Tarball-source behavior: gzip autodetection, early rejection of non-tar
//! input, and metadata extraction from `docker save` archives.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use oci_pillage::tarball::{read_tarball, validate_tarball};

fn append(builder: &mut tar::Builder<File>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

fn write_save_archive(path: &Path, repo_tags: &[&str]) {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    append(
        &mut builder,
        "config.json",
        br#"{"architecture":"amd64","os":"linux"}"#,
    );
    append(&mut builder, "layer0.tar", &[0u8; 1024]);
    append(&mut builder, "layer1.tar", &[0u8; 1024]);

    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": repo_tags,
        "Layers": ["layer0.tar", "layer1.tar"],
    }]);
    append(&mut builder, "manifest.json", manifest.to_string().as_bytes());
    builder.finish().unwrap();
}

#[test]
fn test_validate_accepts_plain_tar() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.tar");
    write_save_archive(&path, &["test/repo:tag"]);
    validate_tarball(&path).unwrap();
}

#[test]
fn test_validate_accepts_gzipped_tar() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("image.tar");
    write_save_archive(&plain, &["test/repo:tag"]);

    let gzipped = dir.path().join("image.tar.gz");
    let mut encoder = GzEncoder::new(File::create(&gzipped).unwrap(), Compression::default());
    encoder
        .write_all(&std::fs::read(&plain).unwrap())
        .unwrap();
    encoder.finish().unwrap();

    validate_tarball(&gzipped).unwrap();
}

#[test]
fn test_validate_rejects_junk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.tar");
    std::fs::write(&path, b"this is definitely not a tar archive, not even close").unwrap();
    assert!(validate_tarball(&path).is_err());

    let empty = dir.path().join("empty.tar");
    std::fs::write(&empty, b"").unwrap();
    assert!(validate_tarball(&empty).is_err());
}

#[test]
fn test_read_tarball_extracts_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.tar");
    write_save_archive(&path, &["dummy.example.com/test/image:v2"]);

    let images = read_tarball(&path).unwrap();
    assert_eq!(images.len(), 1);

    let image = &images[0];
    assert_eq!(image.reference, "dummy.example.com/test/image:v2");
    assert_eq!(image.registry, "dummy.example.com");
    assert_eq!(image.repository, "test/image");
    assert_eq!(image.tag, "v2");
    assert!(image.error.is_none());
    assert!(image.manifest.as_deref().unwrap().contains("layer0.tar"));
    assert!(image
        .config
        .as_deref()
        .unwrap()
        .contains(r#""architecture":"amd64""#));

    let handle = image.layer_handle.as_ref().expect("layer handle set");
    assert_eq!(handle.layer_count(), 2);
    assert!(handle.layer_path(0).unwrap().exists());
    assert!(handle.layer_path(2).is_none());
}

#[test]
fn test_read_tarball_registry_defaults_for_short_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.tar");
    write_save_archive(&path, &["test/repo:tag"]);

    let images = read_tarball(&path).unwrap();
    assert_eq!(images.len(), 1);
    // Registry is populated from the parsed reference, falling back to the
    // default registry hostname for short names.
    assert!(!images[0].registry.is_empty());
    assert_eq!(images[0].tag, "tag");
}

#[test]
fn test_read_tarball_one_image_per_repo_tag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.tar");
    write_save_archive(
        &path,
        &[
            "dummy.example.com/test/image:latest",
            "dummy.example.com/test/image:v1",
        ],
    );

    let images = read_tarball(&path).unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].tag, "latest");
    assert_eq!(images[1].tag, "v1");
    // Both share the same manifest entry, so they fingerprint identically.
    assert_eq!(images[0].manifest, images[1].manifest);
}
