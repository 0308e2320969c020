// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use se_util::{GB, MB};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "lucene")]
    Lucene,
    #[serde(rename = "lucene-async-client")]
    LuceneAsyncClient,
    #[serde(rename = "custom")]
    Custom,
}

impl std::str::FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "lucene" => Self::Lucene,
            "lucene-async-client" => Self::LuceneAsyncClient,
            "custom" => Self::Custom,
            v => bail!("unrecognized engine {:?}", v),
        })
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Lucene => "lucene",
                Self::LuceneAsyncClient => "lucene-async-client",
                Self::Custom => "custom",
            }
        )
    }
}

/// One concrete configuration under test. Immutable once expanded from the
/// config space; doubles as the join key for the treatment's result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    pub server_mem_size: u64,
    pub n_server_threads: u32,
    pub n_client_threads: u32,
    pub query_path: String,
    pub engine: EngineKind,
    pub init_heap_size: u64,
    pub max_heap_size: u64,
    pub lock_memory: bool,
    pub read_ahead_kb: u32,
    pub prefetch_threshold_kb: u32,
    pub enable_prefetch: bool,
}

/// The experiment matrix, one list per dimension. `expand()` is the pure
/// cartesian product in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSpace {
    pub engines: Vec<EngineKind>,
    pub mem_sizes: Vec<u64>,
    pub server_threads: Vec<u32>,
    pub client_threads: Vec<u32>,
    pub query_paths: Vec<String>,
    pub init_heap_sizes: Vec<u64>,
    pub max_heap_sizes: Vec<u64>,
    pub lock_memory: Vec<bool>,
    pub read_ahead_kbs: Vec<u32>,
    pub prefetch_thresholds_kb: Vec<u32>,
    pub enable_prefetch: Vec<bool>,
}

impl Default for ConfigSpace {
    fn default() -> Self {
        Self {
            engines: vec![EngineKind::LuceneAsyncClient],
            mem_sizes: vec![8 * GB],
            server_threads: vec![25],
            client_threads: vec![128],
            query_paths: vec!["/mnt/ssd/short_log".into()],
            init_heap_sizes: vec![300 * MB],
            max_heap_sizes: vec![300 * MB],
            lock_memory: vec![false],
            read_ahead_kbs: vec![32],
            prefetch_thresholds_kb: vec![128],
            enable_prefetch: vec![true],
        }
    }
}

impl ConfigSpace {
    pub fn expand(&self) -> Vec<Treatment> {
        let mut treatments = vec![];
        for &engine in self.engines.iter() {
            for &server_mem_size in self.mem_sizes.iter() {
                for &n_server_threads in self.server_threads.iter() {
                    for &n_client_threads in self.client_threads.iter() {
                        for query_path in self.query_paths.iter() {
                            for &init_heap_size in self.init_heap_sizes.iter() {
                                for &max_heap_size in self.max_heap_sizes.iter() {
                                    for &lock_memory in self.lock_memory.iter() {
                                        for &read_ahead_kb in self.read_ahead_kbs.iter() {
                                            for &prefetch_threshold_kb in
                                                self.prefetch_thresholds_kb.iter()
                                            {
                                                for &enable_prefetch in
                                                    self.enable_prefetch.iter()
                                                {
                                                    treatments.push(Treatment {
                                                        server_mem_size,
                                                        n_server_threads,
                                                        n_client_threads,
                                                        query_path: query_path.clone(),
                                                        engine,
                                                        init_heap_size,
                                                        max_heap_size,
                                                        lock_memory,
                                                        read_ahead_kb,
                                                        prefetch_threshold_kb,
                                                        enable_prefetch,
                                                    });
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        treatments
    }
}

/// Split a workload path's basename alternately on '.' and '_' into key/value
/// tag pairs, e.g. "type_single.docfreq_low" -> {type: single, docfreq: low}.
pub fn workload_tags(path: &str) -> BTreeMap<String, String> {
    let filename = Path::new(path)
        .file_name()
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default();

    let items: Vec<&str> = filename.split('.').flat_map(|v| v.split('_')).collect();

    items
        .chunks_exact(2)
        .map(|kv| (kv[0].to_string(), kv[1].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_is_cartesian() {
        let space = ConfigSpace {
            engines: vec![EngineKind::Lucene, EngineKind::Custom],
            mem_sizes: vec![GB, 2 * GB, 8 * GB],
            client_threads: vec![64, 128],
            ..Default::default()
        };
        let treatments = space.expand();
        assert_eq!(treatments.len(), 2 * 3 * 2);

        // Every combination appears exactly once.
        let mut seen = std::collections::HashSet::new();
        for t in treatments.iter() {
            assert!(seen.insert((t.engine, t.server_mem_size, t.n_client_threads)));
        }
    }

    #[test]
    fn test_workload_tags() {
        let tags = workload_tags("/mnt/ssd/query_workload/single_term/type_single.docfreq_low");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["type"], "single");
        assert_eq!(tags["docfreq"], "low");

        assert!(workload_tags("").is_empty());
        // A trailing unpaired item is dropped rather than inventing a value.
        assert_eq!(workload_tags("/mnt/ssd/type_realistic.log").len(), 1);
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!(
            "lucene-async-client".parse::<EngineKind>().unwrap(),
            EngineKind::LuceneAsyncClient
        );
        assert!("elastic".parse::<EngineKind>().is_err());
    }
}
