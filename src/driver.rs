//! Text command driver.
//!
//! A small deterministic interpreter over the public API, used for
//! reproducible end-to-end tests: each command line returns structured
//! text, and a given command sequence always produces the same output.
//!
//! Mutations outside a `batch` block commit immediately; between `batch`
//! and `commit` they accumulate into one atomic commit. `iter-new` opens
//! the combined iterator, and `iter <op> …` steps it, printing the
//! position as `key=value`, with `=.` for a bare range-key marker and the
//! covering span appended as `[start,end) suffix=value,…`.

use std::path::PathBuf;

use crate::batch::Batch;
use crate::db::Db;
use crate::error::Result;
use crate::iterator::combined::{DbIterator, IterOptions};

pub struct Driver {
    db: Db,
    pending: Option<Batch>,
    iter: Option<DbIterator<'static>>,
}

impl Driver {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            pending: None,
            iter: None,
        }
    }

    /// Runs one command line, returning its output. Errors render as
    /// `err: <message>` instead of propagating.
    pub fn run(&mut self, line: &str) -> String {
        match self.dispatch(line) {
            Ok(out) => out,
            Err(e) => format!("err: {e}"),
        }
    }

    fn dispatch(&mut self, line: &str) -> Result<String> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(String::new());
        };
        let args: Vec<&str> = parts.collect();

        match cmd {
            "batch" => {
                self.pending = Some(Batch::new());
                Ok("OK".into())
            }
            "commit" => {
                let batch = self
                    .pending
                    .take()
                    .ok_or_else(|| crate::Error::InvalidArgument("no open batch".into()))?;
                self.db.apply(&batch, false)?;
                Ok(format!("committed {} records", batch.count()))
            }
            "set" => self.mutate(|b| b.set(arg(&args, 0)?, arg(&args, 1)?)),
            "del" => self.mutate(|b| b.delete(arg(&args, 0)?)),
            "single-del" => self.mutate(|b| b.single_delete(arg(&args, 0)?)),
            "merge" => self.mutate(|b| b.merge(arg(&args, 0)?, arg(&args, 1)?)),
            "del-range" => self.mutate(|b| b.delete_range(arg(&args, 0)?, arg(&args, 1)?)),
            "range-key-set" => self.mutate(|b| {
                b.range_key_set(arg(&args, 0)?, arg(&args, 1)?, arg(&args, 2)?, arg(&args, 3)?)
            }),
            "range-key-unset" => self.mutate(|b| {
                b.range_key_unset(arg(&args, 0)?, arg(&args, 1)?, arg(&args, 2)?)
            }),
            "range-key-del" => {
                self.mutate(|b| b.range_key_delete(arg(&args, 0)?, arg(&args, 1)?))
            }
            "get" => {
                let key = arg(&args, 0)?;
                let value = match args.get(1).and_then(|a| a.strip_prefix("seq=")) {
                    Some(seq) => self.db.get_at(
                        key,
                        seq.parse::<u64>()
                            .map_err(|_| crate::Error::InvalidArgument("bad seq".into()))?,
                    )?,
                    None => self.db.get(key)?,
                };
                Ok(match value {
                    Some(v) => String::from_utf8_lossy(&v).into_owned(),
                    None => "not found".into(),
                })
            }
            "flush" => {
                self.db.flush()?;
                Ok("OK".into())
            }
            "compact" => {
                self.db.compact_all()?;
                Ok("OK".into())
            }
            "maybe-compact" => Ok(if self.db.maybe_compact()? {
                "compacted".into()
            } else {
                "no work".into()
            }),
            "ingest" => {
                let paths: Vec<PathBuf> = args.iter().map(PathBuf::from).collect();
                self.db.ingest(&paths)?;
                Ok("OK".into())
            }
            "ingest-excise" => {
                let start = arg(&args, 0)?.to_vec();
                let end = arg(&args, 1)?.to_vec();
                let paths: Vec<PathBuf> = args[2..].iter().map(PathBuf::from).collect();
                self.db.ingest_and_excise(&paths, Some((start, end)))?;
                Ok("OK".into())
            }
            "checkpoint" => {
                let name = args
                    .first()
                    .ok_or_else(|| crate::Error::InvalidArgument("missing name".into()))?;
                let restrict: Vec<(Vec<u8>, Vec<u8>)> = args[1..]
                    .chunks(2)
                    .filter(|c| c.len() == 2)
                    .map(|c| (c[0].as_bytes().to_vec(), c[1].as_bytes().to_vec()))
                    .collect();
                let restrict = if restrict.is_empty() {
                    None
                } else {
                    Some(restrict.as_slice())
                };
                self.db.checkpoint(name, restrict)?;
                Ok("OK".into())
            }
            "iter-new" => {
                let mut options = IterOptions::default();
                for a in &args {
                    if let Some(v) = a.strip_prefix("lower=") {
                        options.lower = Some(v.as_bytes().to_vec());
                    } else if let Some(v) = a.strip_prefix("upper=") {
                        options.upper = Some(v.as_bytes().to_vec());
                    } else if let Some(v) = a.strip_prefix("mask=") {
                        options.mask_suffix = Some(v.as_bytes().to_vec());
                    }
                }
                self.iter = Some(self.db.iter(options)?);
                Ok("OK".into())
            }
            "iter" => {
                let op = args
                    .first()
                    .ok_or_else(|| crate::Error::InvalidArgument("missing iter op".into()))?;
                let iter = self
                    .iter
                    .as_mut()
                    .ok_or_else(|| crate::Error::InvalidArgument("no open iterator".into()))?;
                match *op {
                    "seek-ge" => iter.seek_ge(arg(&args, 1)?)?,
                    "seek-lt" => iter.seek_lt(arg(&args, 1)?)?,
                    "seek-prefix-ge" => iter.seek_prefix_ge(arg(&args, 1)?)?,
                    "first" => iter.first()?,
                    "last" => iter.last()?,
                    "next" => iter.next()?,
                    "prev" => iter.prev()?,
                    "next-prefix" => iter.next_prefix()?,
                    "close" => {
                        iter.close();
                        return Ok("OK".into());
                    }
                    _ => {
                        return Err(crate::Error::InvalidArgument(format!(
                            "unknown iter op {op}"
                        )))
                    }
                }
                Ok(format_position(iter))
            }
            "metrics" => Ok(self.db.metrics().report()),
            "lsm" => Ok(self.db.describe_levels()),
            _ => Err(crate::Error::InvalidArgument(format!(
                "unknown command {cmd}"
            ))),
        }
    }

    fn mutate(&mut self, op: impl FnOnce(&mut Batch) -> Result<()>) -> Result<String> {
        match &mut self.pending {
            Some(batch) => {
                op(batch)?;
                Ok("OK".into())
            }
            None => {
                let mut batch = Batch::new();
                op(&mut batch)?;
                self.db.apply(&batch, false)?;
                Ok("OK".into())
            }
        }
    }
}

fn arg<'a>(args: &[&'a str], i: usize) -> Result<&'a [u8]> {
    args.get(i)
        .map(|a| a.as_bytes())
        .ok_or_else(|| crate::Error::InvalidArgument(format!("missing argument {i}")))
}

fn format_position(iter: &DbIterator<'_>) -> String {
    if !iter.valid() {
        return ".".into();
    }
    let mut out = String::from_utf8_lossy(iter.key()).into_owned();
    match iter.point_value() {
        Some(v) => {
            out.push('=');
            out.push_str(&String::from_utf8_lossy(v));
        }
        None => out.push_str("=."),
    }
    if let Some((start, end, keys)) = iter.range_key() {
        let rendered: Vec<String> = keys
            .iter()
            .map(|k| {
                format!(
                    "{}={}",
                    String::from_utf8_lossy(&k.suffix),
                    String::from_utf8_lossy(&k.value)
                )
            })
            .collect();
        out.push_str(&format!(
            " [{},{}) {}",
            String::from_utf8_lossy(start),
            String::from_utf8_lossy(end),
            rendered.join(",")
        ));
    }
    out
}
