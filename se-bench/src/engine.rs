// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use se_bench_intf::{Args, EngineKind, Treatment};

/// Per-engine capability set. The controller never branches on the engine
/// kind; everything engine-specific goes through this trait and adding a
/// backend means adding one variant below.
pub trait Engine: Sync {
    fn kind(&self) -> EngineKind;

    /// Server launch command, without the cgroup wrapper (the caller prepends
    /// the resource controller's exec prefix).
    fn server_cmd(&self, args: &Args, t: &Treatment) -> String;
    fn client_cmd(&self, args: &Args, t: &Treatment) -> String;

    /// Process names used for liveness grep and the port probe.
    fn server_proc(&self) -> &'static str;
    fn client_proc(&self) -> &'static str;

    /// Whether the server wants SIGINT to its process group at FINISHING
    /// instead of being left to die with the harness.
    fn graceful_server_stop(&self) -> bool {
        false
    }

    /// Extra wait after issuing the client start command.
    fn client_start_delay(&self) -> Duration {
        Duration::from_secs(0)
    }

    /// Pre-start configuration rendering. Failures here are batch-fatal
    /// preconditions, nothing has been started yet.
    fn prepare(&self, _args: &Args, _t: &Treatment) -> Result<()> {
        Ok(())
    }

    /// Parse the captured client output into a metrics mapping. Missing
    /// expected lines yield an empty map, never an error; the treatment's
    /// result record is still produced without those fields.
    fn parse_client_output(&self, out: &str) -> BTreeMap<String, String>;
}

pub fn engine_for(kind: EngineKind) -> &'static dyn Engine {
    match kind {
        EngineKind::Lucene => &LuceneEngine,
        EngineKind::LuceneAsyncClient => &LuceneAsyncClient,
        EngineKind::Custom => &CustomEngine,
    }
}

pub const ALL_PROC_NAMES: &[&str] = &[
    "java",
    "lucene_bench",
    "async_client",
    "fts_server",
    "fts_bench",
];

fn lucene_server_cmd(args: &Args) -> String {
    format!("{}/bin/lucene-server", &args.lucene_dir)
}

/// Rewrite lines of `<name>.template` that mention a substitution key and
/// write the result next to it as `<name>`.
fn render_config(dir: &Path, name: &str, subst: &[(&str, String)]) -> Result<()> {
    let tmpl_path = dir.join(format!("{}.template", name));
    let tmpl = fs::read_to_string(&tmpl_path)
        .with_context(|| format!("reading {:?}", &tmpl_path))?;

    let mut out = String::new();
    for line in tmpl.lines() {
        match subst.iter().find(|(key, _)| line.contains(key)) {
            Some((_, rendered)) => out.push_str(rendered),
            None => out.push_str(line),
        }
        out.push('\n');
    }

    let out_path = dir.join(name);
    fs::write(&out_path, out).with_context(|| format!("writing {:?}", &out_path))
}

fn prepare_lucene_config(args: &Args, t: &Treatment) -> Result<()> {
    let config_dir = Path::new(&args.lucene_dir).join("config");
    render_config(
        &config_dir,
        "server.yml",
        &[
            (
                "search_threads",
                format!("search_threads: {}", t.n_server_threads),
            ),
            ("lock_memory", format!("lock_memory: {}", t.lock_memory)),
        ],
    )?;
    render_config(
        &config_dir,
        "jvm.options",
        &[
            ("init_heap_size", format!("-Xms{}", t.init_heap_size)),
            ("max_heap_size", format!("-Xmx{}", t.max_heap_size)),
        ],
    )
}

fn parse_lucene_output(out: &str) -> BTreeMap<String, String> {
    let mut d = BTreeMap::new();
    for line in out.lines() {
        if line.starts_with("Throughput:") {
            let cleaned = line.replace(',', " ");
            if let Some(qps) = cleaned.split_whitespace().nth(1) {
                d.insert(
                    "QPS".to_string(),
                    qps.split('.').next().unwrap_or(qps).to_string(),
                );
            }
        } else if line.starts_with("Latencies:") {
            let cleaned = line.replace(',', " ");
            let items: Vec<&str> = cleaned.split_whitespace().collect();
            if items.len() >= 4 {
                d.insert("latency_50th".to_string(), items[1].to_string());
                d.insert("latency_95th".to_string(), items[2].to_string());
                d.insert("latency_99th".to_string(), items[3].to_string());
            }
        }
    }
    d
}

pub struct LuceneEngine;

impl Engine for LuceneEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Lucene
    }

    fn server_cmd(&self, args: &Args, _t: &Treatment) -> String {
        lucene_server_cmd(args)
    }

    fn client_cmd(&self, args: &Args, t: &Treatment) -> String {
        format!(
            "cd {} && python -m bench.lucene_bench {} {} {}",
            &args.bench_dir, &t.query_path, t.n_client_threads, &args.server_addr
        )
    }

    fn server_proc(&self) -> &'static str {
        "java"
    }

    fn client_proc(&self) -> &'static str {
        "lucene_bench"
    }

    fn client_start_delay(&self) -> Duration {
        // This client takes a while to ramp its worker threads up; probing
        // its liveness too early mistakes startup for a crash.
        Duration::from_secs(5)
    }

    fn prepare(&self, args: &Args, t: &Treatment) -> Result<()> {
        prepare_lucene_config(args, t)
    }

    fn parse_client_output(&self, out: &str) -> BTreeMap<String, String> {
        parse_lucene_output(out)
    }
}

pub struct LuceneAsyncClient;

impl Engine for LuceneAsyncClient {
    fn kind(&self) -> EngineKind {
        EngineKind::LuceneAsyncClient
    }

    fn server_cmd(&self, args: &Args, _t: &Treatment) -> String {
        lucene_server_cmd(args)
    }

    fn client_cmd(&self, args: &Args, t: &Treatment) -> String {
        format!(
            "cd {} && python bench/async_client.py {}",
            &args.bench_dir, &t.query_path
        )
    }

    fn server_proc(&self) -> &'static str {
        "java"
    }

    fn client_proc(&self) -> &'static str {
        "async_client"
    }

    fn parse_client_output(&self, _out: &str) -> BTreeMap<String, String> {
        // The async client reports nothing per-query; the record carries
        // telemetry only.
        BTreeMap::new()
    }
}

pub struct CustomEngine;

impl Engine for CustomEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Custom
    }

    fn server_cmd(&self, args: &Args, t: &Treatment) -> String {
        format!(
            "{}/fts_server -sync_type=ASYNC -n_threads={} -addr={} -port=50051 \
             -engine={} -enable_prefetch={} -prefetch_threshold={} -lock_memory={}",
            &args.fts_bin,
            t.n_server_threads,
            &args.server_addr,
            &args.index_spec,
            t.enable_prefetch,
            // The server takes the threshold in 4K blocks.
            t.prefetch_threshold_kb / 4,
            t.lock_memory
        )
    }

    fn client_cmd(&self, args: &Args, t: &Treatment) -> String {
        format!(
            "{}/fts_bench -exp_mode=querylog -n_threads={} -server={} -query_path={}",
            &args.fts_bin, t.n_client_threads, &args.server_addr, &t.query_path
        )
    }

    fn server_proc(&self) -> &'static str {
        "fts_server"
    }

    fn client_proc(&self) -> &'static str {
        "fts_bench"
    }

    fn graceful_server_stop(&self) -> bool {
        true
    }

    fn parse_client_output(&self, out: &str) -> BTreeMap<String, String> {
        let lines: Vec<&str> = out.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if line.contains("latency_95th") {
                if let Some(data) = lines.get(i + 1) {
                    return line
                        .split_whitespace()
                        .zip(data.split_whitespace())
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                }
            }
        }
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dfl_treatment(engine: EngineKind) -> Treatment {
        Treatment {
            server_mem_size: 8 << 30,
            n_server_threads: 25,
            n_client_threads: 128,
            query_path: "/mnt/ssd/short_log".into(),
            engine,
            init_heap_size: 300 << 20,
            max_heap_size: 300 << 20,
            lock_memory: false,
            read_ahead_kb: 32,
            prefetch_threshold_kb: 128,
            enable_prefetch: true,
        }
    }

    #[test]
    fn test_lucene_output_parse() {
        let out = "queries done\n\
                   Throughput: 3423.93 qps\n\
                   Latencies: 1.5, 3.2, 8.7\n\
                   ExperimentFinished!!!\n";
        let d = parse_lucene_output(out);
        assert_eq!(d["QPS"], "3423");
        assert_eq!(d["latency_50th"], "1.5");
        assert_eq!(d["latency_95th"], "3.2");
        assert_eq!(d["latency_99th"], "8.7");
    }

    #[test]
    fn test_lucene_output_missing_lines() {
        assert!(parse_lucene_output("nothing interesting\n").is_empty());
    }

    #[test]
    fn test_custom_output_parse() {
        let out = "count latency_50th latency_95th latency_99th\n\
                   9931 2.1 4.4 9.0\n\
                   ExperimentFinished!!!\n";
        let engine = engine_for(EngineKind::Custom);
        let d = engine.parse_client_output(out);
        assert_eq!(d["count"], "9931");
        assert_eq!(d["latency_95th"], "4.4");

        // A dangling header with no data line degrades to the empty map.
        assert!(engine
            .parse_client_output("count latency_95th")
            .is_empty());
    }

    #[test]
    fn test_async_client_output_is_empty() {
        let engine = engine_for(EngineKind::LuceneAsyncClient);
        assert!(engine
            .parse_client_output("Throughput: 12.3\nLatencies: 1, 2, 3\n")
            .is_empty());
    }

    #[test]
    fn test_custom_server_cmd() {
        let args = Args::default();
        let t = dfl_treatment(EngineKind::Custom);
        let cmd = engine_for(EngineKind::Custom).server_cmd(&args, &t);
        assert!(cmd.contains("-n_threads=25"));
        assert!(cmd.contains("-prefetch_threshold=32"));
        assert!(cmd.contains("-lock_memory=false"));
    }
}
