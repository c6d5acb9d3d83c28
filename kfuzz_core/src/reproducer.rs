use crate::target::FuzzTarget;
use log::debug;
use sha1::{Digest, Sha1};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name prefix of generated reproducers.
pub const REPRODUCER_PREFIX: &str = "reproducer-";
/// Extension of generated reproducers.
pub const REPRODUCER_EXTENSION: &str = "src";

const BYTES_PER_LINE: usize = 16;

#[derive(Error, Debug)]
pub enum ReproducerError {
    #[error("Failed to write reproducer {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hex SHA-1 of the raw crash bytes. Every artifact derived from one crash
/// (crash file, stack trace, reproducer) is suffixed with this value.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

pub fn reproducer_file_name(digest: &str) -> String {
    format!("{REPRODUCER_PREFIX}{digest}.{REPRODUCER_EXTENSION}")
}

/// Renders the source text of one reproducer.
///
/// Implementations must be pure functions of their arguments so that the
/// same crash always yields byte-identical output.
pub trait ReproducerTemplate: Send + Sync {
    fn render(&self, target: &FuzzTarget, digest: &str, input: &[u8]) -> String;
}

/// Emits a standalone `#[test]` that feeds the literal crash bytes through
/// the byte-consuming input wrapper the target decodes its arguments from.
#[derive(Debug, Clone)]
pub struct RustTestTemplate {
    input_type: String,
}

impl RustTestTemplate {
    pub fn new(input_type: impl Into<String>) -> Self {
        Self {
            input_type: input_type.into(),
        }
    }
}

impl Default for RustTestTemplate {
    fn default() -> Self {
        Self::new("ByteInput")
    }
}

impl ReproducerTemplate for RustTestTemplate {
    fn render(&self, target: &FuzzTarget, digest: &str, input: &[u8]) -> String {
        let (owner, method) = target.split_owner();
        let call = if owner.is_empty() {
            method.to_string()
        } else {
            format!("{}::{}", owner.join("::"), method)
        };
        let short = &digest[..digest.len().min(12)];

        let mut out = format!(
            "// kfuzz reproducer sha1:{digest}\n// target: {}\n\n#[test]\nfn reproduce_{short}() {{\n",
            target.name()
        );
        out.push_str(&format!("    let data: [u8; {}] = [\n", input.len()));
        for chunk in input.chunks(BYTES_PER_LINE) {
            let line: Vec<String> = chunk.iter().map(|b| format!("0x{b:02x}")).collect();
            out.push_str(&format!("        {},\n", line.join(", ")));
        }
        out.push_str("    ];\n");
        out.push_str(&format!("    let mut input = {}::new(&data);\n", self.input_type));
        out.push_str(&format!("    {call}(&mut input);\n"));
        out.push_str("}\n");
        out
    }
}

/// Result of asking for a reproducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproducerWrite {
    pub digest: String,
    pub path: PathBuf,
    /// `false` when a reproducer for this crash already existed.
    pub written: bool,
}

/// Generates content-addressed reproducers, at most once per crash.
pub struct ReproducerWriter {
    template: Box<dyn ReproducerTemplate>,
}

impl ReproducerWriter {
    pub fn new(template: Box<dyn ReproducerTemplate>) -> Self {
        Self { template }
    }

    pub fn render(&self, target: &FuzzTarget, crash: &[u8]) -> (String, String) {
        let digest = content_digest(crash);
        let text = self.template.render(target, &digest, crash);
        (digest, text)
    }

    /// Writes `reproducer-<sha1>.src` into `dir` unless it already exists.
    ///
    /// The file is created with no-clobber semantics, so two racing callers
    /// still produce exactly one reproducer.
    pub fn write_if_missing(
        &self,
        target: &FuzzTarget,
        crash: &[u8],
        dir: &Path,
    ) -> Result<ReproducerWrite, ReproducerError> {
        let digest = content_digest(crash);
        let path = dir.join(reproducer_file_name(&digest));
        if path.exists() {
            debug!("Reproducer {path:?} already exists");
            return Ok(ReproducerWrite {
                digest,
                path,
                written: false,
            });
        }

        let text = self.template.render(target, &digest, crash);
        let io_err = |source: io::Error| ReproducerError::Io {
            path: path.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("Wrote reproducer {path:?}");
                Ok(ReproducerWrite {
                    digest,
                    path,
                    written: true,
                })
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(ReproducerWrite {
                digest,
                path,
                written: false,
            }),
            Err(e) => Err(io_err(e.error)),
        }
    }
}

impl Default for ReproducerWriter {
    fn default() -> Self {
        Self::new(Box::new(RustTestTemplate::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn digest_is_sha1_hex() {
        assert_eq!(content_digest(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(content_digest(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn rendering_embeds_bytes_and_call() {
        let writer = ReproducerWriter::new(Box::new(RustTestTemplate::new("KFuzzInput")));
        let target = FuzzTarget::new("org.example.JsonTests.parse");
        let (digest, text) = writer.render(&target, &[0x00, 0x7f, 0xff]);

        assert_eq!(digest, content_digest(&[0x00, 0x7f, 0xff]));
        assert!(text.starts_with(&format!("// kfuzz reproducer sha1:{digest}\n")));
        assert!(text.contains("let data: [u8; 3] = ["));
        assert!(text.contains("0x00, 0x7f, 0xff,"));
        assert!(text.contains("let mut input = KFuzzInput::new(&data);"));
        assert!(text.contains("org::example::JsonTests::parse(&mut input);"));
        assert!(text.contains(&format!("fn reproduce_{}()", &digest[..12])));
    }

    #[test]
    fn rendered_text_is_complete() {
        let target = FuzzTarget::new("a.B.c");
        let text = RustTestTemplate::default().render(&target, "0123456789abcdef", &[1, 2]);
        assert_eq!(
            text,
            "// kfuzz reproducer sha1:0123456789abcdef\n\
             // target: a.B.c\n\
             \n\
             #[test]\n\
             fn reproduce_0123456789ab() {\n\
             \x20   let data: [u8; 2] = [\n\
             \x20       0x01, 0x02,\n\
             \x20   ];\n\
             \x20   let mut input = ByteInput::new(&data);\n\
             \x20   a::B::c(&mut input);\n\
             }\n"
        );
    }

    #[test]
    fn long_inputs_wrap_lines() {
        let target = FuzzTarget::new("fuzz_entry");
        let input: Vec<u8> = (0..40).collect();
        let text = RustTestTemplate::default().render(&target, &content_digest(&input), &input);
        let byte_lines = text.lines().filter(|l| l.trim_start().starts_with("0x")).count();
        assert_eq!(byte_lines, 3);
        assert!(text.contains("    fuzz_entry(&mut input);"));
    }

    #[test]
    fn identical_bytes_give_identical_reproducers() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let writer = ReproducerWriter::default();
        let target = FuzzTarget::new("a.B.c");
        let crash = b"\x01\x02\x03 crash".to_vec();

        let first = writer.write_if_missing(&target, &crash, dir_a.path()).unwrap();
        let second = writer.write_if_missing(&target, &crash, dir_b.path()).unwrap();
        assert!(first.written && second.written);
        assert_eq!(first.path.file_name(), second.path.file_name());
        assert_eq!(
            fs::read(&first.path).unwrap(),
            fs::read(&second.path).unwrap()
        );
    }

    #[test]
    fn existing_reproducer_is_not_regenerated() {
        let dir = tempdir().unwrap();
        let writer = ReproducerWriter::default();
        let target = FuzzTarget::new("a.B.c");
        let crash = b"same".to_vec();
        let path = dir.path().join(reproducer_file_name(&content_digest(&crash)));
        fs::write(&path, "hand edited").unwrap();

        let result = writer.write_if_missing(&target, &crash, dir.path()).unwrap();
        assert!(!result.written);
        assert_eq!(result.path, path);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hand edited");
    }
}
