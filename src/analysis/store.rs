//! Analysis snapshot store
//!
//! One live snapshot per timeframe, mirrored to disk with atomic renames,
//! plus the append-only trade history. A corrupt snapshot file is quarantined
//! with a `.bad` suffix and treated as missing.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{info, warn};

use super::types::{Analysis, Timeframe};
use crate::trading::records::TradeRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("combined snapshot rejected: missing source analyses: {0}")]
    MissingSources(String),
    #[error("combined snapshot rejected: {0} is older than the previous combined analysis")]
    StaleSources(Timeframe),
}

/// The four per-timeframe snapshots a combined pass consumes, fixed at the
/// moment the pass is enqueued.
#[derive(Debug, Clone)]
pub struct SnapshotBundle {
    pub m15: Analysis,
    pub h1: Analysis,
    pub h4: Analysis,
    pub d1: Analysis,
}

impl SnapshotBundle {
    pub fn entries(&self) -> [(Timeframe, &Analysis); 4] {
        [
            (Timeframe::M15, &self.m15),
            (Timeframe::H1, &self.h1),
            (Timeframe::H4, &self.h4),
            (Timeframe::D1, &self.d1),
        ]
    }
}

/// Snapshot store plus trade history. One lock per timeframe entry; the
/// history file has its own append lock.
pub struct AnalysisStore {
    analysis_dir: PathBuf,
    trades_path: PathBuf,
    slots: HashMap<Timeframe, RwLock<Option<Analysis>>>,
    history_lock: Mutex<()>,
}

impl AnalysisStore {
    /// Open (or create) the store under `data_dir`. Existing snapshots are
    /// loaded; unreadable ones are renamed aside.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let analysis_dir = data_dir.join("analysis");
        let trades_dir = data_dir.join("trades");
        fs::create_dir_all(&analysis_dir)?;
        fs::create_dir_all(&trades_dir)?;

        let mut slots = HashMap::new();
        for tf in [
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
            Timeframe::Final,
        ] {
            let loaded = load_snapshot(&analysis_dir, tf);
            slots.insert(tf, RwLock::new(loaded));
        }

        Ok(Self {
            analysis_dir,
            trades_path: trades_dir.join("history.jsonl"),
            slots,
            history_lock: Mutex::new(()),
        })
    }

    fn slot(&self, tf: Timeframe) -> &RwLock<Option<Analysis>> {
        self.slots.get(&tf).expect("all timeframes have a slot")
    }

    /// Latest snapshot for a timeframe, if any.
    pub fn get(&self, tf: Timeframe) -> Option<Analysis> {
        self.slot(tf).read().expect("store lock poisoned").clone()
    }

    /// Replace the snapshot for the analysis's own timeframe. Writing the
    /// combined (`final`) snapshot is gated: all four sources must exist and
    /// be newer than the previous combined snapshot.
    pub fn put(&self, analysis: Analysis) -> Result<(), StoreError> {
        let tf = analysis.source_timeframe;
        if tf == Timeframe::Final {
            self.check_final_gate()?;
        }

        let path = snapshot_path(&self.analysis_dir, tf);
        write_atomic(&path, &analysis)?;

        *self.slot(tf).write().expect("store lock poisoned") = Some(analysis);
        info!("stored {} analysis snapshot", tf);
        Ok(())
    }

    fn check_final_gate(&self) -> Result<(), StoreError> {
        let previous_final = self.get(Timeframe::Final);
        let mut missing = Vec::new();
        for tf in Timeframe::SOURCES {
            match self.get(tf) {
                None => missing.push(tf.as_str()),
                Some(source) => {
                    if let Some(prev) = &previous_final {
                        if source.generated_at <= prev.generated_at {
                            return Err(StoreError::StaleSources(tf));
                        }
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingSources(missing.join(", ")));
        }
        Ok(())
    }

    /// Fix the four source snapshots for a combined pass. `None` when any is
    /// missing; the caller warns and skips the pass.
    pub fn snapshot_bundle(&self) -> Option<SnapshotBundle> {
        Some(SnapshotBundle {
            m15: self.get(Timeframe::M15)?,
            h1: self.get(Timeframe::H1)?,
            h4: self.get(Timeframe::H4)?,
            d1: self.get(Timeframe::D1)?,
        })
    }

    /// Append one trade record to the history log.
    pub fn append_trade(&self, record: &TradeRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.history_lock.lock().expect("history lock poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trades_path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Last `n` trade records, oldest first. Corrupt lines are skipped.
    pub fn history_tail(&self, n: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let _guard = self.history_lock.lock().expect("history lock poisoned");
        let content = match fs::read_to_string(&self.trades_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let records: Vec<TradeRecord> = content
            .lines()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("skipping corrupt history line: {}", err);
                    None
                }
            })
            .collect();
        let start = records.len().saturating_sub(n);
        Ok(records[start..].to_vec())
    }
}

fn snapshot_path(analysis_dir: &Path, tf: Timeframe) -> PathBuf {
    analysis_dir.join(format!("analysis_{}.json", tf.as_str()))
}

/// Write via a temp file in the same directory and rename over the target,
/// so a crash leaves either the old or the new snapshot, never a partial.
fn write_atomic(path: &Path, analysis: &Analysis) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(serde_json::to_string_pretty(analysis)?.as_bytes())?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load_snapshot(analysis_dir: &Path, tf: Timeframe) -> Option<Analysis> {
    let path = snapshot_path(analysis_dir, tf);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("cannot read {} snapshot: {}", tf, err);
            return None;
        }
    };
    match serde_json::from_str::<Analysis>(&content) {
        Ok(analysis) => Some(analysis),
        Err(err) => {
            // Quarantine and carry on as if missing.
            let bad = path.with_extension("json.bad");
            warn!("quarantining corrupt {} snapshot ({}): {:?}", tf, err, bad);
            if let Err(rename_err) = fs::rename(&path, &bad) {
                warn!("failed to quarantine snapshot: {}", rename_err);
            }
            None
        }
    }
}
