//! The coordinator's work queue
//!
//! Holds the retry queue (items that must be handed out again) and every
//! submitted [`FileUnit`]. Items come from the retry queue first, most
//! recently requeued first; only when it is empty is the current file read.
//!
//! At most `max_open_files` units have open streams. Further submissions wait
//! unopened and are opened one for one as open units finish.

use super::file_unit::{DumpJob, FileCodecs, FilePaths, FileUnit, Opened};
use crate::error::{CallResult, SwitchboardError};
use crate::peer::Consumer;
use crate::work::WorkItem;
use log::{error, info};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Queue behavior fixed at startup
#[derive(Clone)]
pub struct QueueOptions {
    pub codecs: FileCodecs,
    pub max_open_files: usize,
    pub clobber: bool,
    pub reprocess: bool,
    pub sort_output: bool,
}

/// Files whose state changed during a queue operation
#[derive(Default)]
pub struct Settled {
    /// Finished units whose output must now be written
    pub dumps: Vec<DumpJob>,
    /// Units that are done (including skipped ones)
    pub done: Vec<u32>,
    /// Units abandoned after an I/O or recovery error
    pub failed: Vec<(u32, String)>,
}

impl Settled {
    pub fn is_empty(&self) -> bool {
        self.dumps.is_empty() && self.done.is_empty() && self.failed.is_empty()
    }

    fn absorb(&mut self, other: Settled) {
        self.dumps.extend(other.dumps);
        self.done.extend(other.done);
        self.failed.extend(other.failed);
    }
}

pub struct WorkQueue {
    options: QueueOptions,
    retry: VecDeque<WorkItem>,
    /// Opened units that are not yet done
    active: BTreeMap<u32, FileUnit>,
    /// Submitted units waiting for an open slot
    unopened: BTreeMap<u32, FileUnit>,
    current: Option<u32>,
    consumers: Vec<Arc<dyn Consumer>>,
    next_file_id: u32,
}

impl WorkQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            retry: VecDeque::new(),
            active: BTreeMap::new(),
            unopened: BTreeMap::new(),
            current: None,
            consumers: Vec::new(),
            next_file_id: 0,
        }
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    pub fn active_files(&self) -> usize {
        self.active.len()
    }

    pub fn unopened_files(&self) -> usize {
        self.unopened.len()
    }

    /// Paths of a submitted unit that is not yet done
    pub fn paths(&self, file_id: u32) -> Option<&FilePaths> {
        self.active
            .get(&file_id)
            .or_else(|| self.unopened.get(&file_id))
            .map(|u| u.paths())
    }

    /// Submit a file; it is opened right away if a slot is free
    ///
    /// An error opening the unit is returned here and the unit is dropped.
    pub fn submit(&mut self, paths: FilePaths) -> CallResult<(u32, Settled)> {
        let id = self.next_file_id;
        self.next_file_id += 1;
        let mut unit = FileUnit::new(id, paths);

        let mut settled = Settled::default();
        if self.active.len() < self.options.max_open_files {
            self.open_unit(&mut unit)?;
            self.place(unit, &mut settled);
        } else {
            info!(
                "{} files open; file No. {} ({}) waits for a free slot",
                self.active.len(),
                id,
                unit.paths().input.display()
            );
            self.unopened.insert(id, unit);
        }
        Ok((id, settled))
    }

    fn open_unit(&mut self, unit: &mut FileUnit) -> CallResult<()> {
        let opened = unit.open(&self.options.codecs, self.options.clobber, self.options.reprocess)?;
        if let Opened::Ready(requeue) = opened {
            if !requeue.is_empty() {
                info!(
                    "file No. {}: {} recovered objects queued for processing",
                    unit.id(),
                    requeue.len()
                );
            }
            // Descending pushes leave the front in ascending order
            for item in requeue.into_iter().rev() {
                self.retry.push_front(item);
            }
        }
        Ok(())
    }

    /// Put an opened unit where it belongs: active, or finished
    fn place(&mut self, mut unit: FileUnit, settled: &mut Settled) {
        if unit.is_done() {
            info!(
                "file No. {} ({}) needs no processing",
                unit.id(),
                unit.paths().input.display()
            );
            settled.done.push(unit.id());
            if let Some(job) = unit.close(&self.options.codecs, self.options.sort_output) {
                settled.dumps.push(job);
            }
        } else {
            self.active.insert(unit.id(), unit);
        }
    }

    /// Open waiting units while slots are free
    fn fill_slots(&mut self) -> Settled {
        let mut settled = Settled::default();
        while self.active.len() < self.options.max_open_files {
            let mut unit = match self.unopened.pop_first() {
                Some((_, unit)) => unit,
                None => break,
            };
            match self.open_unit(&mut unit) {
                Ok(()) => self.place(unit, &mut settled),
                Err(e) => {
                    error!(
                        "file No. {} ({}): {}; abandoning",
                        unit.id(),
                        unit.paths().input.display(),
                        e
                    );
                    settled.failed.push((unit.id(), e.to_string()));
                }
            }
        }
        settled
    }

    pub fn register_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        if let Some(paths) = self.current.and_then(|id| self.active.get(&id)).map(|u| u.paths()) {
            consumer.new_file(&paths.input, &paths.output);
        }
        self.consumers.push(consumer);
    }

    /// Make the next active unit with unread items the current one
    fn advance(&mut self) -> bool {
        let after = self.current.map_or(0, |id| id + 1);
        let next = self
            .active
            .range(after..)
            .chain(self.active.range(..after))
            .find(|(_, unit)| unit.has_next())
            .map(|(&id, _)| id);

        match next {
            Some(id) => {
                if self.current != Some(id) {
                    self.current = Some(id);
                    if let Some(unit) = self.active.get(&id) {
                        let paths = unit.paths();
                        for consumer in &self.consumers {
                            consumer.new_file(&paths.input, &paths.output);
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Next item to hand out, if any; never blocks
    pub fn next_item(&mut self) -> (Option<WorkItem>, Settled) {
        if let Some(item) = self.retry.pop_front() {
            return (Some(item), Settled::default());
        }

        let mut settled = Settled::default();
        loop {
            let current_has_next = self
                .current
                .and_then(|id| self.active.get(&id))
                .map_or(false, |u| u.has_next());
            if !current_has_next && !self.advance() {
                return (None, settled);
            }

            let id = match self.current {
                Some(id) => id,
                None => return (None, settled),
            };
            let result = match self.active.get_mut(&id) {
                Some(unit) => unit.next_item(),
                None => return (None, settled),
            };
            match result {
                Ok(Some(item)) => return (Some(item), settled),
                Ok(None) => continue,
                Err(e) => settled.absorb(self.abandon(id, e)),
            }
        }
    }

    /// Put items back at the front of the retry queue
    ///
    /// Items are pushed in descending order so the smallest comes out first.
    pub fn requeue(&mut self, mut items: Vec<WorkItem>) {
        items.sort_by_key(|item| std::cmp::Reverse(item.id()));
        for item in items {
            self.retry.push_front(item);
        }
    }

    /// Log a confirmed item and finish its unit if it was the last one
    ///
    /// State changes are reported even when the item itself is rejected,
    /// since a failed log write abandons the unit and may open another.
    pub fn complete(&mut self, item: &WorkItem) -> (CallResult<()>, Settled) {
        let file_id = item.file_id();
        let unit = match self.active.get_mut(&file_id) {
            Some(unit) => unit,
            None => {
                let err = SwitchboardError::protocol(format!(
                    "object {} belongs to an unknown file",
                    item.id()
                ));
                return (Err(err), Settled::default());
            }
        };

        if let Err(e) = unit.record(item) {
            let message = e.to_string();
            let settled = self.abandon(file_id, e);
            return (Err(SwitchboardError::service(message)), settled);
        }

        // consumers only hear about items that reached the log
        for consumer in &self.consumers {
            consumer.consume(item);
        }

        let mut settled = Settled::default();
        if unit.is_done() {
            let paths = unit.paths().clone();
            for consumer in &self.consumers {
                consumer.processing_complete(&paths.input, &paths.output);
            }
            if let Some(mut unit) = self.active.remove(&file_id) {
                info!("finished processing file No. {} ({})", file_id, paths.input.display());
                if let Some(job) = unit.close(&self.options.codecs, self.options.sort_output) {
                    settled.dumps.push(job);
                }
            }
            settled.done.push(file_id);
            if self.current == Some(file_id) {
                self.current = None;
            }
            settled.absorb(self.fill_slots());
        }
        (Ok(()), settled)
    }

    /// Drop a unit after an error; its log stays for a later run
    fn abandon(&mut self, file_id: u32, err: SwitchboardError) -> Settled {
        if let Some(unit) = self.active.remove(&file_id) {
            error!(
                "file No. {} ({}): {}; abandoning, its log is kept for a later run",
                file_id,
                unit.paths().input.display(),
                err
            );
        }
        self.retry.retain(|item| item.file_id() != file_id);
        if self.current == Some(file_id) {
            self.current = None;
        }
        let mut settled = Settled {
            failed: vec![(file_id, err.to_string())],
            ..Settled::default()
        };
        settled.absorb(self.fill_slots());
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CodecKind, ObjectReader, ObjectWriter};
    use crate::work::Payload;
    use serde_json::json;
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn options(max_open_files: usize) -> QueueOptions {
        QueueOptions {
            codecs: FileCodecs {
                input: CodecKind::Text.codec(),
                log: CodecKind::Jsonl.codec(),
                output: CodecKind::Text.codec(),
                buf_size: 8192,
            },
            max_open_files,
            clobber: true,
            reprocess: false,
            sort_output: true,
        }
    }

    fn input(dir: &TempDir, name: &str, lines: &[&str]) -> FilePaths {
        let path = dir.path().join(name);
        fs::write(&path, lines.join("\n")).unwrap();
        FilePaths::resolve(path, None, None, ".proc", ".log")
    }

    fn finish(item: &WorkItem) -> WorkItem {
        let mut done = item.clone();
        done.set_payload(json!(format!("done {}", item.number())));
        done.set_processed(true);
        done
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Consumer for Recorder {
        fn new_file(&self, input: &Path, _output: &Path) {
            let name = input.file_name().unwrap().to_string_lossy().to_string();
            self.events.lock().unwrap().push(format!("new {}", name));
        }

        fn consume(&self, item: &WorkItem) {
            self.events.lock().unwrap().push(format!("consume {}", item.id()));
        }

        fn processing_complete(&self, input: &Path, _output: &Path) {
            let name = input.file_name().unwrap().to_string_lossy().to_string();
            self.events.lock().unwrap().push(format!("complete {}", name));
        }
    }

    #[test]
    fn test_requeued_items_come_first_smallest_first() {
        let dir = TempDir::new().unwrap();
        let mut queue = WorkQueue::new(options(10));
        queue.submit(input(&dir, "a.txt", &["0", "1", "2", "3"])).unwrap();

        let a = queue.next_item().0.unwrap();
        let b = queue.next_item().0.unwrap();
        let c = queue.next_item().0.unwrap();
        queue.requeue(vec![c.clone(), a.clone()]);
        queue.requeue(vec![b.clone()]);

        assert_eq!(queue.retry_len(), 3);
        assert_eq!(queue.next_item().0.unwrap().number(), 1);
        assert_eq!(queue.next_item().0.unwrap().number(), 0);
        assert_eq!(queue.next_item().0.unwrap().number(), 2);
        assert_eq!(queue.next_item().0.unwrap().number(), 3);
        assert!(queue.next_item().0.is_none());
    }

    #[test]
    fn test_unknown_file_rejected() {
        let mut queue = WorkQueue::new(options(10));
        let stray = WorkItem::new(7, 0, json!("x"));
        let (result, _) = queue.complete(&stray);
        assert!(matches!(result, Err(SwitchboardError::Protocol { .. })));
    }

    #[test]
    fn test_open_file_cap() {
        let dir = TempDir::new().unwrap();
        let mut queue = WorkQueue::new(options(1));
        let (first, _) = queue.submit(input(&dir, "a.txt", &["a0"])).unwrap();
        let (second, _) = queue.submit(input(&dir, "b.txt", &["b0"])).unwrap();
        assert_eq!(queue.active_files(), 1);
        assert_eq!(queue.unopened_files(), 1);

        let item = queue.next_item().0.unwrap();
        assert_eq!(item.file_id(), first);
        assert!(queue.next_item().0.is_none());

        let (result, settled) = queue.complete(&finish(&item));
        result.unwrap();
        assert_eq!(settled.done, vec![first]);
        assert_eq!(settled.dumps.len(), 1);
        assert_eq!(queue.unopened_files(), 0);

        let item = queue.next_item().0.unwrap();
        assert_eq!(item.file_id(), second);
    }

    #[test]
    fn test_consumers_see_every_file_and_item() {
        let dir = TempDir::new().unwrap();
        let mut queue = WorkQueue::new(options(10));
        let recorder = Arc::new(Recorder::default());
        queue.submit(input(&dir, "a.txt", &["a0"])).unwrap();
        queue.submit(input(&dir, "b.txt", &["b0"])).unwrap();

        let a0 = queue.next_item().0.unwrap();
        queue.register_consumer(recorder.clone());
        let b0 = queue.next_item().0.unwrap();
        queue.complete(&finish(&b0)).0.unwrap();
        queue.complete(&finish(&a0)).0.unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "new a.txt",
                "new b.txt",
                "consume 1:0",
                "complete b.txt",
                "consume 0:0",
                "complete a.txt",
            ]
        );
    }

    /// Log codec whose writes always fail
    struct BrokenLog;

    struct BrokenWriter;

    impl ObjectWriter for BrokenWriter {
        fn write_object(&mut self, _object: &Payload) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Codec for BrokenLog {
        fn kind(&self) -> CodecKind {
            CodecKind::Jsonl
        }

        fn reader(&self, path: &Path, buf_size: usize) -> io::Result<Box<dyn ObjectReader>> {
            CodecKind::Jsonl.codec().reader(path, buf_size)
        }

        fn writer(
            &self,
            _path: &Path,
            _append: bool,
            _buf_size: usize,
        ) -> io::Result<Box<dyn ObjectWriter>> {
            Ok(Box::new(BrokenWriter))
        }
    }

    #[test]
    fn test_failed_log_write_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(10);
        opts.codecs.log = Arc::new(BrokenLog);
        let mut queue = WorkQueue::new(opts);
        let recorder = Arc::new(Recorder::default());
        queue.register_consumer(recorder.clone());
        queue.submit(input(&dir, "a.txt", &["a0", "a1"])).unwrap();

        let item = queue.next_item().0.unwrap();
        let (result, _) = queue.complete(&finish(&item));
        assert!(matches!(result, Err(SwitchboardError::Service { .. })));
        assert_eq!(queue.active_files(), 0);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["new a.txt"]);
    }

    #[test]
    fn test_skipped_file_settles_on_submit() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(10);
        opts.clobber = false;
        let mut queue = WorkQueue::new(opts);
        let paths = input(&dir, "a.txt", &["a0"]);
        fs::write(&paths.output, "already\n").unwrap();

        let (id, settled) = queue.submit(paths).unwrap();
        assert_eq!(settled.done, vec![id]);
        assert!(settled.dumps.is_empty());
        assert!(queue.next_item().0.is_none());
    }
}
