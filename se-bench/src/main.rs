// Copyright (c) Facebook, Inc. and its affiliates.
mod cgroup;
mod engine;
mod proc;
mod results;
mod run;
mod study;
mod telemetry;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::fs;
use std::path::Path;
use std::time::Duration;

use cgroup::{drop_caches, set_read_ahead_kb, set_swap, MemCgroup};
use engine::{engine_for, ALL_PROC_NAMES};
use proc::ShellProcs;
use results::{CrashLog, ExpDir, ResultTable};
use run::{RunCtx, RunOutcome, Timings};
use se_bench_intf::{Args, ConfigSpace, Treatment};
use se_util::{init_logging, sh_ignore_error, sh_output};

struct Program {
    args: Args,
    space: ConfigSpace,
    treatments: Vec<Treatment>,
}

impl Program {
    fn init(args: Args) -> Result<Self> {
        let space = match args.space.as_ref() {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config space {:?}", path))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config space {:?}", path))?
            }
            None => ConfigSpace::default(),
        };

        let treatments = space.expand();
        if treatments.is_empty() {
            bail!("config space expands to zero treatments, is a dimension empty?");
        }
        info!("config space expands to {} treatments", treatments.len());

        Ok(Self {
            args,
            space,
            treatments,
        })
    }

    fn timings(&self) -> Timings {
        match self.args.test {
            true => Timings::test(),
            false => Timings {
                port_timeout: Duration::from_secs(self.args.port_timeout),
                ..Default::default()
            },
        }
    }

    /// Per-treatment preconditions. Anything failing here is batch-fatal;
    /// nothing has been started yet and every later treatment would hit the
    /// same wall.
    fn before_each(&self, procs: &mut ShellProcs, treatment: &Treatment) -> Result<MemCgroup> {
        procs.kill_leftovers(ALL_PROC_NAMES);
        procs.remove_client_out();
        procs.sync_workload(&treatment.query_path)?;

        engine_for(treatment.engine).prepare(&self.args, treatment)?;
        set_read_ahead_kb(&self.args.device, treatment.read_ahead_kb)?;
        if self.args.drop_cache {
            drop_caches()?;
        }
        Ok(MemCgroup::setup(
            &self.args.cgroup,
            treatment.server_mem_size,
            self.args.swappiness,
        )?)
    }

    fn save_dmesg(&self, dir: &Path) {
        match sh_output("dmesg | tail -n 100") {
            Ok(out) => {
                if let Err(e) = fs::write(dir.join("dmesg.txt"), out) {
                    warn!("failed to save dmesg ({:#})", &e);
                }
            }
            Err(e) => warn!("failed to read dmesg ({:#})", &e),
        }
    }

    fn run_batch(&mut self) -> Result<()> {
        let exp = ExpDir::create(&self.args.dir)?;
        exp.save_config(&self.space, &self.treatments)?;

        let mut table = ResultTable::new();
        let mut crash_log = CrashLog::new(exp.crash_log_path());
        let mut procs = ShellProcs::new(self.args.remote.as_deref(), &self.args.client_out);

        sh_ignore_error("sudo dmesg -C");
        set_swap(self.args.os_swap)?;

        for (idx, treatment) in self.treatments.iter().enumerate() {
            info!(
                "treatment {}/{}: {:?}",
                idx + 1,
                self.treatments.len(),
                treatment
            );
            let tdir = exp.treatment_dir(idx)?;
            exp.save_treatment_config(&tdir, treatment)?;
            let engine = engine_for(treatment.engine);
            let cg = self.before_each(&mut procs, treatment)?;

            let telemetry = telemetry::SysTelemetry::new(&self.args.cgroup, &self.args.partition);
            let tracer = match self.args.block_trace {
                true => Some(telemetry::BlockTracer::new(&self.args.device, tdir.clone())),
                false => None,
            };
            let server_cmd = format!(
                "{}{}",
                cg.exec_prefix(),
                engine.server_cmd(&self.args, treatment)
            );
            let client_cmd = engine.client_cmd(&self.args, treatment);

            let outcome = RunCtx::new(
                treatment,
                engine,
                server_cmd,
                client_cmd,
                &mut procs,
                &telemetry,
                tracer,
                self.timings(),
            )
            .run();

            // Crashes and harness errors alike are charged to this treatment
            // and the batch moves on; the invariant is one result row or one
            // crash entry per treatment attempted.
            match outcome {
                Ok(RunOutcome::Done(record)) => {
                    table.append(&record);
                    table.save(&exp.result_path())?;
                    if let Err(e) = procs.archive_client_output(&tdir) {
                        warn!("failed to archive client output ({:#})", &e);
                    }
                }
                Ok(RunOutcome::ServerCrashed) => {
                    crash_log.append("server crash", treatment, "server process gone or port never opened")?;
                    self.save_dmesg(&tdir);
                }
                Ok(RunOutcome::ClientCrashed) => {
                    crash_log.append("client crash", treatment, "client exited without completion marker")?;
                    if let Err(e) = procs.archive_client_output(&tdir) {
                        warn!("failed to archive client output ({:#})", &e);
                    }
                }
                Err(e) => {
                    error!("treatment failed: {:#}", &e);
                    crash_log.append("harness error", treatment, &format!("{:#}", &e))?;
                }
            }

            procs.kill_leftovers(ALL_PROC_NAMES);
        }

        info!(
            "batch done: {} completed, {} crashed, results in {:?}",
            table.len(),
            crash_log.len(),
            exp.top()
        );
        Ok(())
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbosity);

    let rc = Program::init(args).and_then(|mut prog| prog.run_batch());
    if let Err(e) = rc {
        error!("{:#}", &e);
        std::process::exit(1);
    }
}
