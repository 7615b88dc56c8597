//! Per-file work units
//!
//! A [`FileUnit`] moves through two phases:
//!
//! - **Ingest**: the input stream is read one object ahead, and every
//!   confirmed item is appended to the log.
//! - **Dump**: once every item read has been logged, the streams are closed
//!   and a [`DumpJob`] replays the log into the final output file.
//!
//! Opening a unit whose log survives from an earlier run replays that log and
//! re-reads the input to find the items that still need work.

use crate::codec::{Codec, ObjectReader, ObjectWriter};
use crate::error::{CallResult, SwitchboardError};
use crate::work::{Payload, WorkItem};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Input, output, and log paths of one submitted file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

impl FilePaths {
    /// Fill in missing output and log paths from the input name
    ///
    /// The output defaults to `input + output_suffix`. The log defaults to
    /// `output + log_suffix` when an output was given, else `input + log_suffix`.
    pub fn resolve(
        input: PathBuf,
        output: Option<PathBuf>,
        log: Option<PathBuf>,
        output_suffix: &str,
        log_suffix: &str,
    ) -> Self {
        let log = match (&log, &output) {
            (Some(log), _) => log.clone(),
            (None, Some(output)) => with_suffix(output, log_suffix),
            (None, None) => with_suffix(&input, log_suffix),
        };
        let output = output.unwrap_or_else(|| with_suffix(&input, output_suffix));
        Self { input, output, log }
    }
}

/// `path` with `suffix` appended to its final component
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Codecs and buffer size shared by every unit
#[derive(Clone)]
pub struct FileCodecs {
    pub input: Arc<dyn Codec>,
    pub log: Arc<dyn Codec>,
    pub output: Arc<dyn Codec>,
    pub buf_size: usize,
}

/// Result of opening a unit
#[derive(Debug)]
pub enum Opened {
    /// The output already exists and clobbering is off; nothing to do
    Skipped,
    /// Ready for work, with the items an earlier run left unfinished
    Ready(Vec<WorkItem>),
}

/// What recovery found in a surviving log
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    /// Items to hand out again, in ascending order
    pub requeue: Vec<WorkItem>,
    /// Sequence number the next read will get
    pub next_number: u64,
    /// Items counted as already logged
    pub logged: u64,
    pub more_to_read: bool,
    /// Length of the log up to the end of its last intact entry
    pub log_len: u64,
}

impl Recovered {
    fn fresh(log_len: u64) -> Self {
        Self {
            requeue: Vec::new(),
            next_number: 0,
            logged: 0,
            more_to_read: true,
            log_len,
        }
    }
}

enum Phase {
    Unopened,
    Ingest {
        input: Option<Box<dyn ObjectReader>>,
        log: Option<Box<dyn ObjectWriter>>,
    },
    Closed,
}

pub struct FileUnit {
    id: u32,
    paths: FilePaths,
    phase: Phase,
    lookahead: Option<WorkItem>,
    next_number: u64,
    logged: u64,
    more_to_read: bool,
    skipped: bool,
}

impl FileUnit {
    pub fn new(id: u32, paths: FilePaths) -> Self {
        Self {
            id,
            paths,
            phase: Phase::Unopened,
            lookahead: None,
            next_number: 0,
            logged: 0,
            more_to_read: true,
            skipped: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn paths(&self) -> &FilePaths {
        &self.paths
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.phase, Phase::Unopened)
    }

    /// Whether an item is ready to hand out
    pub fn has_next(&self) -> bool {
        self.lookahead.is_some()
    }

    /// Items read so far
    pub fn items_read(&self) -> u64 {
        self.next_number
    }

    pub fn items_logged(&self) -> u64 {
        self.logged
    }

    /// All input has been read and every item read has been logged
    ///
    /// Once true this never becomes false again.
    pub fn is_done(&self) -> bool {
        self.is_open()
            && !self.more_to_read
            && self.lookahead.is_none()
            && self.logged == self.next_number
    }

    pub fn open(&mut self, codecs: &FileCodecs, clobber: bool, reprocess: bool) -> CallResult<Opened> {
        if !clobber && self.paths.output.exists() {
            info!(
                "{}: output {} already exists; treating file No. {} as done",
                self.paths.input.display(),
                self.paths.output.display(),
                self.id
            );
            self.more_to_read = false;
            self.skipped = true;
            self.phase = Phase::Closed;
            return Ok(Opened::Skipped);
        }

        let mut input = codecs.input.reader(&self.paths.input, codecs.buf_size)?;
        let recovered = if self.paths.log.exists() {
            let recovered = self.recover(codecs, input.as_mut(), reprocess)?;
            // new entries must not land on the tail of a partial one
            trim_log(&self.paths.log, recovered.log_len)?;
            recovered
        } else {
            Recovered::fresh(0)
        };

        self.next_number = recovered.next_number;
        self.logged = recovered.logged;
        self.more_to_read = recovered.more_to_read;
        self.phase = Phase::Ingest {
            input: Some(input),
            log: None,
        };

        if let Err(e) = self.read_ahead() {
            self.revert();
            return Err(e);
        }

        if !self.is_done() {
            let log = match codecs.log.writer(&self.paths.log, true, codecs.buf_size) {
                Ok(log) => log,
                Err(e) => {
                    self.revert();
                    return Err(e.into());
                }
            };
            if let Phase::Ingest { log: slot, .. } = &mut self.phase {
                *slot = Some(log);
            }
        }

        Ok(Opened::Ready(recovered.requeue))
    }

    fn revert(&mut self) {
        self.phase = Phase::Unopened;
        self.lookahead = None;
        self.next_number = 0;
        self.logged = 0;
        self.more_to_read = true;
    }

    /// Reconcile a surviving log with the input
    ///
    /// Reads the log and the input but never writes either, so running it
    /// twice against the same files gives the same answer.
    pub fn recover(
        &self,
        codecs: &FileCodecs,
        input: &mut dyn ObjectReader,
        reprocess: bool,
    ) -> CallResult<Recovered> {
        let replay = replay_log(codecs.log.as_ref(), &self.paths.log, codecs.buf_size)
            .map_err(|e| self.recovery_error(format!("cannot read log: {}", e)))?;

        let mut processed: BTreeMap<u64, bool> = BTreeMap::new();
        for entry in &replay.items {
            if processed.insert(entry.number(), entry.processed()).is_some() {
                warn!(
                    "{}: object No. {} logged more than once; using the later entry",
                    self.paths.log.display(),
                    entry.number()
                );
            }
        }

        let max = match processed.keys().next_back() {
            Some(&max) => max,
            None => return Ok(Recovered::fresh(replay.valid_len)),
        };

        let mut requeue = Vec::new();
        for number in 0..=max {
            let payload = input
                .read_object()
                .map_err(|e| self.recovery_error(format!("input read failed at object No. {}: {}", number, e)))?
                .ok_or_else(|| {
                    self.recovery_error(format!(
                        "input ended at object No. {} but the log goes up to No. {}",
                        number, max
                    ))
                })?;
            let redo = match processed.get(&number) {
                None => true,
                Some(done) => reprocess && !done,
            };
            if redo {
                requeue.push(WorkItem::new(self.id, number, payload));
            }
        }

        // The previous run may have read one object past the last one logged
        let mut next_number = max + 1;
        let mut more_to_read = true;
        match input.read_object() {
            Ok(Some(payload)) => {
                requeue.push(WorkItem::new(self.id, next_number, payload));
                next_number += 1;
            }
            Ok(None) => more_to_read = false,
            Err(e) => {
                return Err(self.recovery_error(format!(
                    "input read failed at object No. {}: {}",
                    next_number, e
                )))
            }
        }

        let logged = next_number - requeue.len() as u64;
        info!(
            "{}: recovered {} logged objects; {} to redo",
            self.paths.input.display(),
            logged,
            requeue.len()
        );

        Ok(Recovered {
            requeue,
            next_number,
            logged,
            more_to_read,
            log_len: replay.valid_len,
        })
    }

    fn recovery_error(&self, message: String) -> SwitchboardError {
        SwitchboardError::Recovery {
            path: self.paths.input.clone(),
            message,
        }
    }

    fn read_ahead(&mut self) -> CallResult<()> {
        if self.lookahead.is_some() || !self.more_to_read {
            return Ok(());
        }
        let input = match &mut self.phase {
            Phase::Ingest { input: Some(input), .. } => input,
            _ => {
                self.more_to_read = false;
                return Ok(());
            }
        };
        match input.read_object()? {
            Some(payload) => {
                self.lookahead = Some(WorkItem::new(self.id, self.next_number, payload));
                self.next_number += 1;
            }
            None => {
                debug!("{}: end of input after {} objects", self.paths.input.display(), self.next_number);
                self.more_to_read = false;
                if let Phase::Ingest { input, .. } = &mut self.phase {
                    *input = None;
                }
            }
        }
        Ok(())
    }

    /// Hand out the next unread item
    pub fn next_item(&mut self) -> CallResult<Option<WorkItem>> {
        let item = match self.lookahead.take() {
            Some(item) => item,
            None => return Ok(None),
        };
        self.read_ahead()?;
        Ok(Some(item))
    }

    /// Append a confirmed item to the log
    pub fn record(&mut self, item: &WorkItem) -> CallResult<()> {
        let log = match &mut self.phase {
            Phase::Ingest { log: Some(log), .. } => log,
            _ => {
                return Err(SwitchboardError::protocol(format!(
                    "file No. {} is not accepting results",
                    self.id
                )))
            }
        };
        let record = serde_json::to_value(item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        log.write_object(&record)?;
        log.flush()?;
        self.logged += 1;
        Ok(())
    }

    /// Close all streams; returns the dump to run unless the unit was skipped
    pub fn close(&mut self, codecs: &FileCodecs, sort: bool) -> Option<DumpJob> {
        self.phase = Phase::Closed;
        if self.skipped {
            return None;
        }
        Some(DumpJob {
            file_id: self.id,
            paths: self.paths.clone(),
            log_codec: codecs.log.clone(),
            output_codec: codecs.output.clone(),
            buf_size: codecs.buf_size,
            sort,
        })
    }
}

/// Work items read back from a log
#[derive(Debug)]
pub struct LogReplay {
    pub items: Vec<WorkItem>,
    /// Byte offset just past the last intact entry
    pub valid_len: u64,
}

/// Read every work item in a log
///
/// A record cut short at the end of the log (a crash mid-write) ends the
/// replay with a warning; everything before it is kept.
pub fn replay_log(codec: &dyn Codec, path: &Path, buf_size: usize) -> CallResult<LogReplay> {
    let mut reader = codec.reader(path, buf_size)?;
    let mut items = Vec::new();
    let mut valid_len = 0;
    loop {
        match reader.read_object() {
            Ok(Some(record)) => match serde_json::from_value::<WorkItem>(record) {
                Ok(item) => {
                    items.push(item);
                    valid_len = reader.position();
                }
                Err(e) => {
                    warn!(
                        "{}: malformed log entry after {} entries ({}); ignoring the rest",
                        path.display(),
                        items.len(),
                        e
                    );
                    break;
                }
            },
            Ok(None) => break,
            Err(e)
                if e.kind() == io::ErrorKind::InvalidData
                    || e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                warn!(
                    "{}: log ends in a partial entry after {} entries ({})",
                    path.display(),
                    items.len(),
                    e
                );
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(LogReplay { items, valid_len })
}

/// Cut a log back to `valid_len` bytes if anything follows its last intact entry
fn trim_log(path: &Path, valid_len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    if len > valid_len {
        warn!(
            "{}: dropping {} bytes of partial entry at the end of the log",
            path.display(),
            len - valid_len
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Replay of a finished unit's log into its output file
pub struct DumpJob {
    pub file_id: u32,
    pub paths: FilePaths,
    log_codec: Arc<dyn Codec>,
    output_codec: Arc<dyn Codec>,
    buf_size: usize,
    sort: bool,
}

impl DumpJob {
    /// Write the output file; returns the number of objects written
    ///
    /// The output is written beside its final name and renamed into place,
    /// so a crash never leaves a partial output file.
    pub fn run(&self) -> CallResult<usize> {
        let entries = replay_log(self.log_codec.as_ref(), &self.paths.log, self.buf_size)?.items;

        let payloads: Vec<Payload> = if self.sort {
            let mut by_number = BTreeMap::new();
            for entry in entries {
                by_number.insert(entry.number(), entry.into_payload());
            }
            by_number.into_values().collect()
        } else {
            entries.into_iter().map(WorkItem::into_payload).collect()
        };

        let staging = with_suffix(&self.paths.output, ".tmp");
        let mut writer = self.output_codec.writer(&staging, false, self.buf_size)?;
        for payload in &payloads {
            writer.write_object(payload)?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&staging, &self.paths.output)?;

        Ok(payloads.len())
    }
}
