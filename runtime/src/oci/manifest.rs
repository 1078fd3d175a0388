//! Registry manifest documents.
//!
//! A tagged image resolves to a manifest index listing one manifest per
//! platform. The selected platform manifest names the config blob and the
//! ordered layer blobs (index 0 is the bottom-most layer). Documents are
//! parsed into the `oci-spec` image types.

use minibox_core::error::{BoxError, Result};
pub use oci_spec::image::{Arch, Descriptor, ImageIndex, ImageManifest, Os, Platform};

/// Manifest index (OCI image index or Docker manifest list).
pub type ManifestIndex = ImageIndex;

/// Per-platform manifest; `layers()` are in overlay order, bottom first.
pub type PlatformManifest = ImageManifest;

/// Layer descriptor; same shape as any other blob descriptor.
pub type LayerDescriptor = Descriptor;

/// Operating system the runtime pulls images for.
pub const TARGET_OS: Os = Os::Linux;

/// CPU architecture the runtime pulls images for.
pub const TARGET_ARCH: Arch = Arch::Amd64;

/// Accept header values for manifest index requests.
pub const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Accept header values for platform manifest requests.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Whether `entry` targets `os`/`arch`. Entries without a platform (e.g.
/// attestations) never match.
pub fn matches_platform(entry: &Descriptor, os: &Os, arch: &Arch) -> bool {
    entry
        .platform()
        .as_ref()
        .map_or(false, |p| p.os() == os && p.architecture() == arch)
}

/// Select the linux/amd64 entry of `index`.
///
/// When several entries match (e.g. differing variants) the first one in
/// index order wins.
pub fn select_platform(index: &ManifestIndex) -> Result<&Descriptor> {
    select(index, &TARGET_OS, &TARGET_ARCH)
}

/// Select the first entry for `os`/`arch` in index order.
pub fn select<'a>(index: &'a ManifestIndex, os: &Os, arch: &Arch) -> Result<&'a Descriptor> {
    index
        .manifests()
        .iter()
        .find(|entry| matches_platform(entry, os, arch))
        .ok_or_else(|| BoxError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        })
}

/// Split a digest into `(algorithm, hex)`.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    match digest.split_once(':') {
        Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() => Ok((alg, hex)),
        _ => Err(BoxError::Other(format!("Malformed digest '{}'", digest))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index(entries: &[(&str, &str, &str)]) -> ManifestIndex {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(digest, os, arch)| {
                json!({
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": digest,
                    "size": 500,
                    "platform": {"architecture": arch, "os": os}
                })
            })
            .collect();
        serde_json::from_value(json!({"schemaVersion": 2, "manifests": manifests})).unwrap()
    }

    #[test]
    fn test_select_platform_regardless_of_order() {
        let a = index(&[("sha256:mac", "darwin", "arm64"), ("sha256:lin", "linux", "amd64")]);
        assert_eq!(select_platform(&a).unwrap().digest(), "sha256:lin");

        let b = index(&[("sha256:lin", "linux", "amd64"), ("sha256:mac", "darwin", "arm64")]);
        assert_eq!(select_platform(&b).unwrap().digest(), "sha256:lin");
    }

    #[test]
    fn test_select_platform_first_match_wins() {
        let idx = index(&[
            ("sha256:arm", "linux", "arm64"),
            ("sha256:first", "linux", "amd64"),
            ("sha256:second", "linux", "amd64"),
        ]);
        assert_eq!(select_platform(&idx).unwrap().digest(), "sha256:first");
    }

    #[test]
    fn test_select_platform_missing() {
        let idx = index(&[("sha256:arm", "linux", "arm64")]);
        match select_platform(&idx).unwrap_err() {
            BoxError::UnsupportedPlatform { os, arch } => {
                assert_eq!(os, "linux");
                assert_eq!(arch, "amd64");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_entry_without_platform_never_matches() {
        let idx: ManifestIndex = serde_json::from_str(
            r#"{"schemaVersion":2,"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:att","size":1}]}"#,
        )
        .unwrap();
        assert!(select_platform(&idx).is_err());
    }

    #[test]
    fn test_parse_docker_manifest_list() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
                {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                 "digest": "sha256:aaa", "size": 525,
                 "platform": {"architecture": "amd64", "os": "linux"}},
                {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                 "digest": "sha256:bbb", "size": 525,
                 "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}}
            ]
        }"#;
        let idx: ManifestIndex = serde_json::from_str(json).unwrap();
        assert_eq!(idx.manifests().len(), 2);
        let arm = idx.manifests()[1].platform().as_ref().unwrap();
        assert_eq!(arm.variant().as_deref(), Some("v7"));
        assert_eq!(select_platform(&idx).unwrap().digest(), "sha256:aaa");
    }

    #[test]
    fn test_parse_platform_manifest_keeps_layer_order() {
        let json = r#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 10},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l0", "size": 1},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l1", "size": 2}
            ]
        }"#;
        let m: PlatformManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.config().digest(), "sha256:cfg");
        let digests: Vec<_> = m.layers().iter().map(|l| l.digest().as_str()).collect();
        assert_eq!(digests, vec!["sha256:l0", "sha256:l1"]);
    }

    #[test]
    fn test_split_digest() {
        assert_eq!(split_digest("sha256:abc").unwrap(), ("sha256", "abc"));
        assert!(split_digest("abc").is_err());
        assert!(split_digest("sha256:").is_err());
    }
}
