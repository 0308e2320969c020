// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-d, --dir=[TOPDIR]          'Top dir for experiment results (dfl: {dfl_dir})'
             -s, --space=[FILE]          'Config space json file (dfl: built-in space)'
             -r, --remote=[HOST]         'Host to run the client load generator on (workload is rsynced there)'
                 --server-addr=[ADDR]    'Address clients connect to (dfl: {dfl_addr})'
             -D, --device=[DEV]          'Block device under the server data (dfl: {dfl_dev})'
             -P, --partition=[PART]      'Partition watched by iostat (dfl: {dfl_part})'
             -c, --cgroup=[NAME]         'Memory cgroup confining the server (dfl: {dfl_cg})'
                 --lucene-dir=[DIR]      'Lucene server distribution directory'
                 --bench-dir=[DIR]       'Directory holding the python client benchmarks'
                 --fts-bin=[DIR]         'Directory holding fts_server and fts_bench'
                 --index-spec=[SPEC]     'Index spec passed to fts_server -engine'
                 --client-out=[FILE]     'Captured client output file (dfl: {dfl_out})'
                 --port-timeout=[SECS]   'Give up on server port readiness after SECS (dfl: {dfl_pt})'
                 --swappiness=[VAL]      'memory.swappiness for the server cgroup (dfl: {dfl_swpn})'
                 --no-swap               'Disable OS swap for the batch'
                 --keep-cache            'Skip dropping page cache before each treatment'
                 --block-trace           'Record a block-level I/O trace during each run'
                 --test                  'Test mode, shrinks all fixed delays'
             -v...                       'Sets the level of verbosity'",
            dfl_dir = dfl.dir,
            dfl_addr = dfl.server_addr,
            dfl_dev = dfl.device,
            dfl_part = dfl.partition,
            dfl_cg = dfl.cgroup,
            dfl_out = dfl.client_out,
            dfl_pt = dfl.port_timeout,
            dfl_swpn = dfl.swappiness,
        )
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub dir: String,
    pub space: Option<String>,
    pub remote: Option<String>,
    pub server_addr: String,
    pub device: String,
    pub partition: String,
    pub cgroup: String,
    pub lucene_dir: String,
    pub bench_dir: String,
    pub fts_bin: String,
    pub index_spec: String,
    pub client_out: String,
    pub port_timeout: u64,
    pub swappiness: u32,
    pub os_swap: bool,
    pub drop_cache: bool,
    pub block_trace: bool,

    #[serde(skip)]
    pub test: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            dir: "./se-results".into(),
            space: None,
            remote: None,
            server_addr: "localhost".into(),
            device: "nvme0n1".into(),
            partition: "nvme0n1p4".into(),
            cgroup: "confine".into(),
            lucene_dir: "/opt/lucene-server".into(),
            bench_dir: "/opt/se-bench/clients".into(),
            fts_bin: "/opt/fts/build".into(),
            index_spec: "dump:/mnt/ssd/fts_index".into(),
            client_out: "/tmp/client.out".into(),
            port_timeout: 120,
            swappiness: 60,
            os_swap: true,
            drop_cache: true,
            block_trace: false,
            test: false,
            verbosity: 0,
        }
    }
}

/// A present but unparsable value is the user's mistake; absent means the
/// default. The silent middle ground would run a long batch with a timeout
/// the user never asked for.
fn parse_num<T: std::str::FromStr>(val: Option<&str>, dfl: T) -> Result<T, String> {
    match val {
        Some(v) => v.parse().map_err(|_| v.to_string()),
        None => Ok(dfl),
    }
}

fn num_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str, dfl: T) -> T {
    match parse_num(matches.value_of(name), dfl) {
        Ok(v) => v,
        Err(v) => clap::Error::with_description(
            &format!("invalid value {:?} for --{}", v, name),
            clap::ErrorKind::InvalidValue,
        )
        .exit(),
    }
}

impl Args {
    pub fn parse() -> Self {
        let matches = clap::App::new("se-bench")
            .version(clap::crate_version!())
            .about("Search-engine memory/IO experiment harness")
            .args_from_usage(&ARGS_STR)
            .get_matches();
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        let dfl = Self::default();
        let mut args = Self {
            dir: matches.value_of("dir").unwrap_or(&dfl.dir).into(),
            space: matches.value_of("space").map(Into::into),
            remote: matches.value_of("remote").map(Into::into),
            server_addr: matches
                .value_of("server-addr")
                .unwrap_or(&dfl.server_addr)
                .into(),
            device: matches.value_of("device").unwrap_or(&dfl.device).into(),
            partition: matches
                .value_of("partition")
                .unwrap_or(&dfl.partition)
                .into(),
            cgroup: matches.value_of("cgroup").unwrap_or(&dfl.cgroup).into(),
            lucene_dir: matches
                .value_of("lucene-dir")
                .unwrap_or(&dfl.lucene_dir)
                .into(),
            bench_dir: matches
                .value_of("bench-dir")
                .unwrap_or(&dfl.bench_dir)
                .into(),
            fts_bin: matches.value_of("fts-bin").unwrap_or(&dfl.fts_bin).into(),
            index_spec: matches
                .value_of("index-spec")
                .unwrap_or(&dfl.index_spec)
                .into(),
            client_out: matches
                .value_of("client-out")
                .unwrap_or(&dfl.client_out)
                .into(),
            port_timeout: num_arg(matches, "port-timeout", dfl.port_timeout),
            swappiness: num_arg(matches, "swappiness", dfl.swappiness),
            os_swap: !matches.is_present("no-swap"),
            drop_cache: !matches.is_present("keep-cache"),
            block_trace: matches.is_present("block-trace"),
            test: matches.is_present("test"),
            verbosity: matches.occurrences_of("v") as u32,
        };
        if args.verbosity == 0 && args.test {
            args.verbosity = 1;
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num(None, 120u64), Ok(120));
        assert_eq!(parse_num(Some("30"), 120u64), Ok(30));
        assert_eq!(parse_num(Some("2m"), 120u64), Err("2m".to_string()));
        assert_eq!(parse_num(Some("-1"), 60u32), Err("-1".to_string()));
    }
}
