//! Checkpointing: flat-file persistence for contexts.
//!
//! The format is line-oriented text, one `id row col value` record per line,
//! space-separated. Scalar variables carry the `(-1, -1)` sentinel
//! coordinates. Floats use Rust's shortest-round-trip formatting, so a saved
//! context re-imports bit-for-bit. Saves are atomic: records go to a temp
//! file in the destination directory which is then persisted over the target,
//! so a crash mid-save never leaves a truncated checkpoint behind.

use crate::context::{Context, ContextTemplate};
use crate::key::{Key, VariableKey};
use std::fmt::Display;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors reading or writing a checkpoint file.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: malformed record {record:?}")]
    Malformed { line: usize, record: String },
    #[error("line {line}: record for unknown variable {key}")]
    UnknownKey { line: usize, key: String },
    #[error("no record for variable {key}")]
    MissingKey { key: String },
}

/// Writes every `(key, value)` pair of `ctx` to `path`, atomically.
///
/// Opaque ids are written with their `Display` form and must not contain
/// whitespace.
pub fn save_context<K>(ctx: &Context<K>, path: &Path) -> Result<(), CheckpointError>
where
    K: Key + Display,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    for i in 0..ctx.len() {
        let key = ctx.template().key_at(i);
        writeln!(
            tmp,
            "{} {} {} {}",
            key.id(),
            key.row(),
            key.col(),
            ctx.value_at(i)
        )?;
    }
    tmp.persist(path).map_err(|e| CheckpointError::Io(e.error))?;
    Ok(())
}

/// Reads a context for `template` back from `path`.
///
/// Fails on malformed records, records for keys the template does not
/// catalogue, and template keys with no record.
pub fn load_context<K>(
    template: Rc<ContextTemplate<K>>,
    path: &Path,
) -> Result<Context<K>, CheckpointError>
where
    K: Key + FromStr,
{
    let text = std::fs::read_to_string(path)?;
    let mut values: Vec<Option<f64>> = vec![None; template.len()];

    for (i, record) in text.lines().enumerate() {
        let line = i + 1;
        if record.trim().is_empty() {
            continue;
        }
        let malformed = || CheckpointError::Malformed {
            line,
            record: record.to_string(),
        };
        let mut fields = record.split_whitespace();
        let id: K = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let row: i64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let col: i64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let value: f64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        if fields.next().is_some() || value.is_nan() {
            return Err(malformed());
        }

        let key = VariableKey::with_coords(id, row, col);
        let index = template
            .index_of(&key)
            .ok_or_else(|| CheckpointError::UnknownKey {
                line,
                key: format!("{key:?}"),
            })?;
        values[index] = Some(value);
    }

    let mut resolved = Vec::with_capacity(template.len());
    for (i, value) in values.into_iter().enumerate() {
        match value {
            Some(v) => resolved.push(v),
            None => {
                return Err(CheckpointError::MissingKey {
                    key: format!("{:?}", template.key_at(i)),
                })
            }
        }
    }
    Ok(Context::from_values(template, resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn mixed_template() -> Rc<ContextTemplate<String>> {
        ContextTemplate::new(vec![
            VariableKey::scalar("bias".to_string()),
            VariableKey::cell("w".to_string(), 0, 0),
            VariableKey::cell("w".to_string(), 0, 1),
            VariableKey::cell("w".to_string(), 1, 0),
        ])
    }

    #[test]
    fn round_trips_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let template = mixed_template();
        let values = vec![0.1 + 0.2, -1.0e-300, f64::MAX, 42.0];
        let ctx = Context::from_values(Rc::clone(&template), values.clone());

        save_context(&ctx, &path).unwrap();
        let loaded = load_context(template, &path).unwrap();
        for (i, v) in values.iter().enumerate() {
            assert_eq!(loaded.value_at(i).to_bits(), v.to_bits(), "value {i} drifted");
        }
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let template = mixed_template();
        let first = Context::zeros(Rc::clone(&template));
        let second = Context::from_values(Rc::clone(&template), vec![1.0, 2.0, 3.0, 4.0]);

        save_context(&first, &path).unwrap();
        save_context(&second, &path).unwrap();
        let loaded = load_context(template, &path).unwrap();
        assert_eq!(loaded.value_at(3), 4.0);
    }

    #[test]
    fn rejects_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        std::fs::write(&path, "bias -1 -1 not-a-number\n").unwrap();
        let err = load_context(mixed_template(), &path).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { line: 1, .. }));
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        std::fs::write(&path, "mystery 0 0 1.5\n").unwrap();
        let err = load_context(mixed_template(), &path).unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownKey { line: 1, .. }));
    }

    #[test]
    fn rejects_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        std::fs::write(&path, "bias -1 -1 0.5\n").unwrap();
        let err = load_context(mixed_template(), &path).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingKey { .. }));
    }
}
