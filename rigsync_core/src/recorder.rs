//! Frame-timing ledger.
//!
//! Records which frame of each camera landed in which sync index, as CSV
//! `sync_index,camera_id,frame_index,frame_time`. Absent cameras get no row.

use crate::error::LogError;
use crate::observation_log::{expect_header, parse_field, split_row};
use crate::packets::{CameraId, SyncIndex, SyncPacket};
use crate::session_runtime::Subscription;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use tracing::debug;

pub const FRAME_TIME_HEADER: &str = "sync_index,camera_id,frame_index,frame_time";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTimeRow {
    pub sync_index: SyncIndex,
    pub camera_id: CameraId,
    pub frame_index: u64,
    pub frame_time: f64,
}

/// Session consumer writing the frame-timing ledger.
pub struct FrameTimeLedger<W: Write> {
    out: W,
    rows: u64,
}

impl FrameTimeLedger<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> FrameTimeLedger<W> {
    pub fn new(mut out: W) -> Result<Self, LogError> {
        writeln!(out, "{FRAME_TIME_HEADER}")?;
        Ok(Self { out, rows: 0 })
    }

    pub fn record(&mut self, packet: &SyncPacket) -> Result<(), LogError> {
        for (camera_id, slot) in &packet.cameras {
            let Some(slot) = slot else {
                continue;
            };
            writeln!(
                self.out,
                "{},{},{},{}",
                packet.sync_index, camera_id, slot.frame.frame_index, slot.frame.timestamp
            )?;
            self.rows += 1;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> Result<W, LogError> {
        self.out.flush()?;
        Ok(self.out)
    }

    /// Record until the session ends.
    pub async fn run(mut self, mut subscription: Subscription) -> Result<(W, u64), LogError> {
        while let Some(packet) = subscription.recv().await {
            self.record(&packet)?;
        }
        let rows = self.rows;
        debug!("Frame time ledger '{}' done, {} rows", subscription.name(), rows);
        Ok((self.finish()?, rows))
    }
}

pub fn read_frame_times<R: BufRead>(reader: R) -> Result<Vec<FrameTimeRow>, LogError> {
    let mut lines = reader.lines();
    expect_header(&mut lines, FRAME_TIME_HEADER)?;

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        let line_no = i + 2;
        if line.trim().is_empty() {
            continue;
        }
        let [sync, camera, frame, time] = split_row::<4>(&line, line_no)?;
        rows.push(FrameTimeRow {
            sync_index: parse_field(sync, "sync_index", line_no)?,
            camera_id: parse_field(camera, "camera_id", line_no)?,
            frame_index: parse_field(frame, "frame_index", line_no)?,
            frame_time: parse_field(time, "frame_time", line_no)?,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{CameraSlot, FramePacket};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    #[test]
    fn test_absent_cameras_have_no_row() {
        let mut cameras = BTreeMap::new();
        cameras.insert(
            0,
            Some(CameraSlot {
                frame: FramePacket::new(0, 41, 1.3666666666666667),
                points: None,
            }),
        );
        cameras.insert(1, None);
        cameras.insert(
            2,
            Some(CameraSlot {
                frame: FramePacket::new(2, 40, 1.368),
                points: None,
            }),
        );
        let packet = SyncPacket {
            sync_index: 9,
            timestamp: 1.367,
            cameras,
            dropped: vec![1],
        };

        let mut ledger = FrameTimeLedger::new(Vec::new()).unwrap();
        ledger.record(&packet).unwrap();
        assert_eq!(ledger.rows(), 2);

        let rows = read_frame_times(Cursor::new(ledger.finish().unwrap())).unwrap();
        assert_eq!(
            rows,
            vec![
                FrameTimeRow { sync_index: 9, camera_id: 0, frame_index: 41, frame_time: 1.3666666666666667 },
                FrameTimeRow { sync_index: 9, camera_id: 2, frame_index: 40, frame_time: 1.368 },
            ]
        );
    }
}
