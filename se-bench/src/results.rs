// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use se_bench_intf::{ConfigSpace, Treatment};
use se_util::{format_unix_time, now_stamp, unix_now, MB};

/// Everything one completed treatment produced. Engine metrics are free-form
/// key-value pairs; the telemetry fields are always present, with a missing
/// median meaning the run finished before a single monitoring sample landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub metrics: BTreeMap<String, String>,
    pub cache_mb_median: Option<f64>,
    pub cache_mb_max: u64,
    pub kb_read: u64,
    pub tags: BTreeMap<String, String>,
    pub treatment: Treatment,
}

impl ResultRecord {
    /// Flatten into one row of the result table. Treatment parameters come
    /// first so rows stay comparable across engines with different metrics.
    pub fn columns(&self) -> BTreeMap<String, String> {
        let t = &self.treatment;
        let mut row = BTreeMap::new();
        row.insert("engine".into(), t.engine.to_string());
        row.insert("mem_mb".into(), (t.server_mem_size / MB).to_string());
        row.insert("server_threads".into(), t.n_server_threads.to_string());
        row.insert("client_threads".into(), t.n_client_threads.to_string());
        row.insert("query_path".into(), t.query_path.clone());
        row.insert("init_heap_mb".into(), (t.init_heap_size / MB).to_string());
        row.insert("max_heap_mb".into(), (t.max_heap_size / MB).to_string());
        row.insert("lock_memory".into(), t.lock_memory.to_string());
        row.insert("read_ahead_kb".into(), t.read_ahead_kb.to_string());
        row.insert(
            "prefetch_threshold_kb".into(),
            t.prefetch_threshold_kb.to_string(),
        );
        row.insert("enable_prefetch".into(), t.enable_prefetch.to_string());

        row.insert(
            "cache_mb_median".into(),
            match self.cache_mb_median {
                Some(v) => format!("{}", v),
                None => "NA".into(),
            },
        );
        row.insert("cache_mb_max".into(), self.cache_mb_max.to_string());
        row.insert("kb_read".into(), self.kb_read.to_string());

        for (k, v) in self.tags.iter().chain(self.metrics.iter()) {
            row.insert(k.clone(), v.clone());
        }
        row
    }
}

const COL_WIDTH: usize = 24;

/// Accumulates result rows and rewrites `result.txt` in full after each
/// completed treatment, so a batch killed halfway still leaves a readable
/// table behind. Columns are the sorted union of every key seen so far;
/// rows missing a column show NA.
#[derive(Default)]
pub struct ResultTable {
    rows: Vec<BTreeMap<String, String>>,
}

impl ResultTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn append(&mut self, record: &ResultRecord) {
        self.rows.push(record.columns());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn render(&self) -> String {
        let cols: BTreeSet<&String> = self.rows.iter().flat_map(|row| row.keys()).collect();

        let mut out = String::new();
        for col in cols.iter() {
            out.push_str(&format!("{:<1$}", col, COL_WIDTH));
        }
        out.push('\n');
        for row in self.rows.iter() {
            for col in cols.iter() {
                let val = row.get(*col).map(String::as_str).unwrap_or("NA");
                out.push_str(&format!("{:<1$}", val, COL_WIDTH));
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).with_context(|| format!("writing {:?}", path))?;
        info!("result table updated, {} rows", self.rows.len());
        Ok(())
    }
}

/// Append-only log of treatments that died instead of finishing. One
/// timestamped entry per crash, with enough of the treatment to rerun it by
/// hand.
pub struct CrashLog {
    path: PathBuf,
    entries: usize,
}

impl CrashLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, entries: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn append(&mut self, what: &str, treatment: &Treatment, detail: &str) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {:?}", &self.path))?;
        writeln!(
            f,
            "[{}] {}: {} ({:?})",
            format_unix_time(unix_now()),
            what,
            detail,
            treatment
        )?;
        self.entries += 1;
        Ok(())
    }
}

/// On-disk layout of one batch: a fresh timestamped top directory holding the
/// result table, the crash log, the expanded configuration snapshot, and one
/// subdirectory per treatment for archived client output and traces.
pub struct ExpDir {
    top: PathBuf,
}

impl ExpDir {
    pub fn create(base: &str) -> Result<Self> {
        let top = Path::new(base).join(format!("exp-{}", now_stamp()));
        fs::create_dir_all(&top).with_context(|| format!("creating {:?}", &top))?;
        info!("experiment directory: {:?}", &top);
        Ok(Self { top })
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    pub fn result_path(&self) -> PathBuf {
        self.top.join("result.txt")
    }

    pub fn crash_log_path(&self) -> PathBuf {
        self.top.join("crash.log")
    }

    pub fn treatment_dir(&self, idx: usize) -> Result<PathBuf> {
        let dir = self.top.join(format!("treatment-{:03}", idx));
        fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", &dir))?;
        Ok(dir)
    }

    /// Snapshot of the expanded configuration space, written up front so an
    /// aborted batch still records what it was going to run.
    pub fn save_config(&self, space: &ConfigSpace, treatments: &[Treatment]) -> Result<()> {
        let path = self.top.join("config.json");
        let doc = serde_json::json!({
            "space": space,
            "treatments": treatments,
        });
        fs::write(&path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("writing {:?}", &path))
    }

    /// Per-treatment snapshot next to its archived output, so any one row of
    /// the table can be traced back to its exact configuration.
    pub fn save_treatment_config(&self, dir: &Path, treatment: &Treatment) -> Result<()> {
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(treatment)?)
            .with_context(|| format!("writing {:?}", &path))
    }
}
