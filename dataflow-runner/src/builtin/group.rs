//! Group-by processor.
//!
//! Collects messages into per-key directories on the shared volume and emits
//! a complete group as one JSON array once the end-of-group expression
//! matches. An exclusive file lock per group provides cross-replica mutual
//! exclusion; this requires the volume to be shared between replicas.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use crate::builtin::{expr_env, Processor};
use dataflow_core::crd::{GroupFormat, GroupSpec};
use dataflow_core::expr;
use dataflow_core::meta::Meta;

pub struct Group {
    key: String,
    end_of_group: String,
    format: GroupFormat,
    path: PathBuf,
}

impl Group {
    /// Create a new instance, preparing the groups directory.
    pub fn new(spec: GroupSpec, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path).context("error creating groups dir")?;
        Ok(Self {
            key: spec.key,
            end_of_group: spec.end_of_group,
            format: spec.format,
            path,
        })
    }

    fn with_lock<T>(&self, dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = PathBuf::from(format!("{}.lock", dir.display()));
        let lock = fs::File::create(&lock_path).with_context(|| format!("error creating lock file {:?}", lock_path))?;
        lock.lock_exclusive().with_context(|| format!("error locking {:?}", lock_path))?;
        let result = f();
        if let Err(err) = lock.unlock() {
            tracing::error!(error = ?err, lock = ?lock_path, "error unlocking group");
        }
        result
    }

    fn collect_group(&self, dir: &Path) -> Result<Vec<u8>> {
        let mut entries: Vec<(SystemTime, PathBuf)> = vec![];
        for entry in fs::read_dir(dir).context("error reading group dir")? {
            let entry = entry.context("error reading group dir entry")?;
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .context("error reading group file metadata")?;
            entries.push((modified, entry.path()));
        }
        // Creation-date order, at the accuracy of the system clock.
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut msgs = Vec::with_capacity(entries.len());
        for (_modified, path) in entries {
            msgs.push(fs::read(&path).with_context(|| format!("error reading group file {:?}", path))?);
        }
        let data = match self.format {
            GroupFormat::JsonBytesArray => {
                let encoded: Vec<String> = msgs.iter().map(|msg| base64::encode(msg)).collect();
                serde_json::to_vec(&encoded).context("error serializing group")?
            }
            GroupFormat::JsonStringArray => {
                let strings: Vec<String> = msgs.iter().map(|msg| String::from_utf8_lossy(msg).into_owned()).collect();
                serde_json::to_vec(&strings).context("error serializing group")?
            }
        };
        fs::remove_dir_all(dir).context("error removing completed group dir")?;
        Ok(data)
    }
}

impl Processor for Group {
    fn process(&self, meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        let env = expr_env(meta, msg);
        let group = expr::eval_str(&self.key, &env).context("key expression must return a string")?;
        if group.is_empty() || !group.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            bail!("group key {:?} is not a valid directory name", group);
        }
        let dir = self.path.join(&group);

        self.with_lock(&dir, || {
            fs::create_dir_all(&dir).context("error creating group sub-dir")?;
            let file = dir.join(uuid::Uuid::new_v4().to_string());
            fs::write(&file, msg).with_context(|| format!("error writing message file {:?}", file))?;
            let end = expr::eval_bool(&self.end_of_group, &env).context("end-of-group expression must return a bool")?;
            if !end {
                return Ok(vec![]);
            }
            Ok(vec![self.collect_group(&dir)?])
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn group_fixture(dir: &Path) -> Group {
        Group::new(
            GroupSpec {
                key: "'orders'".into(),
                end_of_group: "string(msg) == 'end'".into(),
                format: GroupFormat::JsonStringArray,
            },
            dir,
        )
        .expect("error building group fixture")
    }

    fn meta_fixture() -> Meta {
        Meta::new("urn:dataflow:http:test", "id", chrono::Utc::now())
    }

    #[test]
    fn accumulates_until_end_of_group() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let group = group_fixture(tmp.path());
        let meta = meta_fixture();

        assert!(group.process(&meta, b"a")?.is_empty());
        assert!(group.process(&meta, b"b")?.is_empty());
        let out = group.process(&meta, b"end")?;
        assert_eq!(out.len(), 1);
        let strings: Vec<String> = serde_json::from_slice(&out[0])?;
        assert_eq!(strings, vec!["a", "b", "end"]);

        // The group directory is gone; a fresh group starts clean.
        assert!(group.process(&meta, b"c")?.is_empty());
        Ok(())
    }

    #[test]
    fn bytes_format_base64_encodes() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let group = Group::new(
            GroupSpec {
                key: "'k'".into(),
                end_of_group: "true".into(),
                format: GroupFormat::JsonBytesArray,
            },
            tmp.path(),
        )?;
        let out = group.process(&meta_fixture(), b"payload")?;
        let encoded: Vec<String> = serde_json::from_slice(&out[0])?;
        assert_eq!(encoded, vec![base64::encode(b"payload")]);
        Ok(())
    }

    #[test]
    fn keys_route_to_separate_groups() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let group = Group::new(
            GroupSpec {
                key: "string(msg)".into(),
                end_of_group: "false".into(),
                format: GroupFormat::JsonStringArray,
            },
            tmp.path(),
        )?;
        let meta = meta_fixture();
        group.process(&meta, b"alpha")?;
        group.process(&meta, b"beta")?;
        assert!(tmp.path().join("alpha").is_dir());
        assert!(tmp.path().join("beta").is_dir());
        Ok(())
    }

    #[test]
    fn hostile_keys_are_rejected() {
        let tmp = tempfile::tempdir().expect("error creating tempdir");
        let group = Group::new(
            GroupSpec {
                key: "'../escape'".into(),
                end_of_group: "true".into(),
                format: GroupFormat::JsonStringArray,
            },
            tmp.path(),
        )
        .expect("error building group");
        assert!(group.process(&meta_fixture(), b"x").is_err());
    }
}
