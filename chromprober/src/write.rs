use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crossbeam_channel::Receiver;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info};

use chromprobe::{AnalyteTarget, IsotopicPeakSet};

use crate::types::RecordCollator;

/// The outcome of searching for one analyte, written as one JSON line
#[derive(Debug, Clone, Serialize)]
pub struct TargetRecord {
    pub index: usize,
    pub target: AnalyteTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peaks: Option<IsotopicPeakSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recalculated: Option<IsotopicPeakSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetRecord {
    pub fn new(index: usize, target: AnalyteTarget) -> Self {
        Self {
            index,
            target,
            peaks: None,
            recalculated: None,
            error: None,
        }
    }
}

/// Open `path` for writing, or STDOUT when it is `-`. Paths ending in `.gz` are gzip
/// compressed.
pub(crate) fn open_output(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::BufWriter::new(io::stdout())));
    }
    let handle = io::BufWriter::new(fs::File::create(path)?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzEncoder::new(handle, Compression::best())))
    } else {
        Ok(Box::new(handle))
    }
}

fn write_record<W: Write>(writer: &mut W, record: &TargetRecord) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")
}

/// Write records in target order as they arrive from `receiver`, returning the number
/// written once every sender has hung up
pub(crate) fn write_records<W: Write>(
    mut writer: W,
    receiver: Receiver<(usize, TargetRecord)>,
) -> io::Result<usize> {
    let mut collator = RecordCollator::default();
    let mut written = 0usize;
    for (index, record) in receiver.iter() {
        collator.receive(index, record);
        while let Some((_, record)) = collator.try_next() {
            write_record(&mut writer, &record)?;
            written += 1;
        }
    }
    collator.done = true;

    let n = collator.waiting.len();
    if n > 0 {
        debug!("Draining output queue, {n} items");
        let waiting_items = std::mem::take(&mut collator.waiting)
            .into_iter()
            .sorted_by_key(|(i, _)| *i);
        for (_, record) in waiting_items {
            write_record(&mut writer, &record)?;
            written += 1;
        }
    }
    writer.flush()?;
    info!("Finished writing | Records={written}");
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_in_target_order() -> io::Result<()> {
        let (sender, receiver) = crossbeam_channel::bounded(8);
        for i in [2usize, 0, 3, 1] {
            let mut record = TargetRecord::new(i, AnalyteTarget::new(400.0 + i as f64, 1, vec![1.0]));
            if i == 3 {
                record.error = Some("failed".to_string());
            }
            sender.send((i, record)).unwrap();
        }
        drop(sender);

        let mut buffer = Vec::new();
        let written = write_records(&mut buffer, receiver)?;
        assert_eq!(written, 4);

        let text = String::from_utf8(buffer).unwrap();
        let indices: Vec<u64> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["index"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(!text.lines().next().unwrap().contains("\"error\""));
        assert!(text.lines().last().unwrap().contains("\"error\":\"failed\""));
        Ok(())
    }
}
