//! Store validation.
//!
//! Walks items and free slots together in file order and checks that they
//! tile the file exactly, that every header on disk agrees with the index,
//! and that every value still matches its checksum.

use std::collections::HashSet;
use std::io::Write;

use crate::error::{Result, StoreError};
use crate::index::{fold_key, StoreItem};
use crate::storage::layout::{FreeHeader, StoreHeader, FREE_HEADER_SIZE, STORE_HEADER_SIZE};
use crate::storage::FreeListItem;

use super::read::load_item;
use super::StoreEngine;

/// Summary of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub objects: usize,
    pub free_slots: usize,
    pub free_bytes: u64,
    pub file_size: u64,
    /// Problems found (report mode only; otherwise the first one is returned as an error)
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

enum Range<'a> {
    Item(&'a StoreItem),
    Free(FreeListItem),
}

impl Range<'_> {
    fn offset(&self) -> u32 {
        match self {
            Range::Item(item) => item.offset,
            Range::Free(free) => free.offset,
        }
    }

    fn size(&self) -> u32 {
        match self {
            Range::Item(item) => item.slot_size(),
            Range::Free(free) => free.size,
        }
    }
}

impl StoreEngine {
    /// Check the whole store.
    ///
    /// With a sink every slot and every problem is written to it and the
    /// walk carries on; without one the first problem is returned as an error.
    pub fn validate(&mut self, mut sink: Option<&mut dyn Write>) -> Result<ValidationReport> {
        self.ensure_ready()?;

        let case_sensitive = self.items.case_sensitive();
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        let mut report = ValidationReport {
            objects: self.items.len(),
            free_slots: self.free.len(),
            free_bytes: self.free.total_free(),
            file_size: file.len(),
            problems: Vec::new(),
        };

        if let Some(w) = sink.as_mut() {
            writeln!(w, "store     {}", file.path().display())?;
            writeln!(
                w,
                "size      {} bytes, {} objects, {} free slots ({} bytes free)",
                report.file_size, report.objects, report.free_slots, report.free_bytes
            )?;
        }

        // Store header
        let mut raw = [0u8; STORE_HEADER_SIZE as usize];
        if let Err(e) = file
            .read_at(0, &mut raw)
            .and_then(|_| StoreHeader::decode(&raw, file.path()).map(|_| ()))
        {
            note(&mut sink, &mut report, e)?;
        }

        // Items and free slots in file order
        let mut ranges: Vec<Range> = self
            .items
            .iter()
            .map(Range::Item)
            .chain(self.free.iter().copied().map(Range::Free))
            .collect();
        ranges.sort_by_key(|r| r.offset());

        let mut expected = STORE_HEADER_SIZE as u64;
        let mut seen = HashSet::new();
        let mut value = Vec::new();

        for range in &ranges {
            let offset = range.offset() as u64;
            if offset != expected {
                note(&mut sink, &mut report, StoreError::Gap { offset, expected })?;
            }

            match range {
                Range::Item(item) => {
                    if let Some(w) = sink.as_mut() {
                        writeln!(
                            w,
                            "item  {:>10} {:>8}  v{:<6} {}",
                            item.offset,
                            item.slot_size(),
                            item.version,
                            item.key
                        )?;
                    }
                    if let Err(e) = load_item(file, item, &mut value) {
                        note(&mut sink, &mut report, e)?;
                    }
                    if !seen.insert(fold_key(&item.key, case_sensitive)) {
                        note(&mut sink, &mut report, StoreError::DuplicateKey { key: item.key.clone() })?;
                    }
                }
                Range::Free(free) => {
                    if let Some(w) = sink.as_mut() {
                        writeln!(w, "free  {:>10} {:>8}", free.offset, free.size)?;
                    }
                    let mut raw = [0u8; FREE_HEADER_SIZE as usize];
                    let on_disk = file
                        .read_at(offset, &mut raw)
                        .and_then(|_| FreeHeader::decode(&raw, offset));
                    match on_disk {
                        Ok(header) if header.size != free.size => {
                            let e = StoreError::SlotSizeMismatch {
                                offset,
                                index: free.size,
                                disk: header.size,
                            };
                            note(&mut sink, &mut report, e)?;
                        }
                        Ok(_) => {}
                        Err(e) => note(&mut sink, &mut report, e)?,
                    }
                }
            }

            expected = offset + range.size() as u64;
        }

        if expected != file.len() {
            let e = StoreError::UncoveredTail {
                covered: expected,
                file_len: file.len(),
            };
            note(&mut sink, &mut report, e)?;
        }

        if let Some(w) = sink.as_mut() {
            if report.is_clean() {
                writeln!(w, "result    OK")?;
            } else {
                writeln!(w, "result    {} problem(s)", report.problems.len())?;
            }
        }

        Ok(report)
    }
}

/// Record a problem in report mode, or fail with it otherwise.
/// I/O failures always end the walk.
fn note(sink: &mut Option<&mut dyn Write>, report: &mut ValidationReport, problem: StoreError) -> Result<()> {
    if problem.is_io() {
        return Err(problem);
    }
    match sink.as_mut() {
        Some(w) => {
            writeln!(w, "PROBLEM   {}", problem)?;
            report.problems.push(problem.to_string());
            Ok(())
        }
        None => Err(problem),
    }
}
