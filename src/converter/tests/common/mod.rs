//! Shared fixtures: a stand-in `nydus-image` and OCI tar builders.
//!
//! The fake builder keeps the real tool's command-line contract:
//!
//! - `create` tars the source directory into `--blob` and writes one line
//!   per regular file (the sha256 of its content) to `--bootstrap`.
//! - `merge` concatenates the source bootstraps and reports each source's
//!   file name as a blob ID, except sources whose every line appears in the
//!   `--chunk-dict` bootstrap.
//! - `unpack` copies `--blob` (or an empty tar) to `--output`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use nydus_convert::{Backend, Digest, ReaderAt, Result};
use parking_lot::Mutex;

const FAKE_BUILDER: &str = r#"#!/bin/sh
set -e
op="$1"
shift
blob=""
bootstrap=""
output=""
output_json=""
dict=""
while [ $# -gt 0 ]; do
    case "$1" in
        --blob) blob="$2"; shift 2 ;;
        --bootstrap) bootstrap="$2"; shift 2 ;;
        --output) output="$2"; shift 2 ;;
        --output-json) output_json="$2"; shift 2 ;;
        --chunk-dict) dict="${2#bootstrap=}"; shift 2 ;;
        --*) shift 2 ;;
        *) break ;;
    esac
done
case "$op" in
create)
    cat > /dev/null
    src="$1"
    (cd "$src" && find . -type f ! -name '.wh.*' | sort | while read -r f; do
        sha256sum < "$f" | cut -d' ' -f1
    done) > "$bootstrap"
    echo "created bootstrap for $src"
    tar -C "$src" -cf "$blob" .
    ;;
merge)
    cat > /dev/null
    : > "$bootstrap"
    ids=""
    for p in "$@"; do
        cat "$p" >> "$bootstrap"
        id=$(basename "$p")
        if [ -n "$dict" ] && [ -s "$p" ] && ! grep -vxFf "$dict" "$p" > /dev/null; then
            continue
        fi
        case " $ids " in
            *" $id "*) continue ;;
        esac
        ids="$ids $id"
    done
    printf '{"blobs":[' > "$output_json"
    sep=""
    for id in $ids; do
        printf '%s"%s"' "$sep" "$id" >> "$output_json"
        sep=","
    done
    printf ']}\n' >> "$output_json"
    ;;
unpack)
    if [ -n "$blob" ]; then
        cat "$blob" > "$output"
    else
        tar -cf "$output" -T /dev/null
    fi
    ;;
*)
    echo "unknown operation $op" >&2
    exit 2
    ;;
esac
"#;

/// Path of the fake builder, written once per test binary.
pub fn fake_builder() -> PathBuf {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| write_script("fake-nydus-image", FAKE_BUILDER))
        .clone()
}

/// Write an executable script under the target tmp dir.
pub fn write_script(name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(format!("scripts-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let tmp = dir.join(format!(".{}.tmp", name));
    {
        let mut file = std::fs::File::create(&tmp).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::rename(&tmp, &path).unwrap();
    path
}

pub enum Entry<'a> {
    Dir,
    File(&'a [u8]),
}

/// Build an uncompressed OCI layer tar.
pub fn oci_tar(entries: &[(&str, Entry<'_>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, entry) in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            Entry::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, path, std::io::empty()).unwrap();
            }
            Entry::File(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append_data(&mut header, path, *data).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub fn lower_tar() -> Vec<u8> {
    oci_tar(&[
        ("dir-1", Entry::Dir),
        ("dir-1/file-1", Entry::File(b"lower-file-1")),
        ("dir-1/file-2", Entry::File(b"lower-file-2")),
    ])
}

pub fn upper_tar() -> Vec<u8> {
    oci_tar(&[
        ("dir-1", Entry::Dir),
        ("dir-1/.wh.file-1", Entry::File(b"")),
        ("dir-2", Entry::Dir),
        ("dir-2/file-1", Entry::File(b"upper-file-1")),
        ("dir-2/file-2", Entry::File(b"upper-file-2")),
        ("dir-2/file-3", Entry::File(b"upper-file-3")),
    ])
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// Regular files of a tar, keyed by path without a leading `./`.
pub fn tar_files(data: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let path = path.trim_start_matches("./").to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        files.insert(path, content);
    }
    files
}

/// Entries of a directory tree relative to `root`, excluding directories.
pub fn dir_entries(root: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    if let Ok(read_dir) = std::fs::read_dir(root) {
        for entry in read_dir.flatten() {
            entries.push(entry.path());
        }
    }
    entries
}

/// Backend keeping pushed blobs in memory.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<Digest, u64>>,
    pushes: Mutex<usize>,
}

impl MemoryBackend {
    pub fn pushes(&self) -> usize {
        *self.pushes.lock()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn push(&self, reader: Arc<dyn ReaderAt>, digest: &Digest) -> Result<()> {
        self.blobs.lock().insert(digest.clone(), reader.size());
        *self.pushes.lock() += 1;
        Ok(())
    }

    async fn check(&self, digest: &Digest) -> Result<bool> {
        Ok(self.contains(digest))
    }

    fn kind(&self) -> &str {
        "memory"
    }
}
