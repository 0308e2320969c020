// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::results::ResultRecord;
use crate::study::SampleSeries;
use crate::telemetry::BlockTracer;
use se_bench_intf::{workload_tags, Treatment};

/// The literal last line of the client output signalling normal completion.
pub const FINISH_SENTINEL: &str = "ExperimentFinished!!!";

/// Handle to a process the harness started, possibly just the local end of an
/// ssh session driving the real one on another host.
#[derive(Debug, Clone)]
pub struct ProcHandle {
    pub pid: Option<i32>,
    pub name: String,
}

/// Process operations the controller needs. The server/client are independent
/// binaries, possibly on different hosts; everything here is process-table
/// inspection and signalling, no in-process heartbeat exists.
pub trait ProcOps {
    fn start_server(&mut self, cmd: &str) -> Result<ProcHandle>;
    fn start_client(&mut self, cmd: &str) -> Result<ProcHandle>;
    fn server_running(&self, name: &str) -> Result<bool>;
    fn client_running(&self, name: &str) -> Result<bool>;
    fn port_open(&self, name: &str) -> Result<bool>;
    /// Idempotent; also used to flush a just-exited client's buffered output.
    fn terminate_client(&mut self, name: &str) -> Result<()>;
    fn interrupt_server_group(&self, handle: &ProcHandle) -> Result<()>;
    /// Last line of the captured client output, None if nothing is there yet.
    fn client_tail(&self) -> Result<Option<String>>;
    fn client_output(&self) -> Result<String>;
}

pub trait Telemetry {
    fn page_cache_mb(&self) -> Result<u64>;
    fn device_kb_read(&self) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ServerStarting,
    ServerReady,
    ClientRunning,
    Monitoring,
    Finishing,
    Done,
    ServerCrashed,
    ClientCrashed,
}

/// Treatment-level outcome. Crashes are terminal for the treatment but the
/// batch driver proceeds to the next configuration; only `Err` out of
/// `RunCtx::run` (converted at the driver boundary) and pre-start setup
/// failures mean more than one treatment is affected.
#[derive(Debug)]
pub enum RunOutcome {
    Done(Box<ResultRecord>),
    ServerCrashed,
    ClientCrashed,
}

/// Every wait in the controller is a fixed blocking sleep; the only bounded
/// poll is port readiness. Tests shrink all of these to zero.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Server warm-up (index load) before the port is even worth probing.
    pub warmup: Duration,
    /// Port probe period and overall deadline.
    pub port_poll: Duration,
    pub port_timeout: Duration,
    /// Settle time after the port opens.
    pub port_settle: Duration,
    /// Gap between SERVER_READY and the client start.
    pub ready_delay: Duration,
    /// Monitoring tick period.
    pub tick: Duration,
    /// Wait for a dead client's buffered stdout to reach the output file.
    pub flush_grace: Duration,
    /// Wait after signalling shutdown before final telemetry capture.
    pub drain: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(15),
            port_poll: Duration::from_secs(2),
            port_timeout: Duration::from_secs(120),
            port_settle: Duration::from_secs(2),
            ready_delay: Duration::from_secs(1),
            tick: Duration::from_secs(1),
            flush_grace: Duration::from_secs(30),
            drain: Duration::from_secs(8),
        }
    }
}

impl Timings {
    pub fn test() -> Self {
        Self {
            warmup: Duration::from_millis(0),
            port_poll: Duration::from_millis(0),
            port_timeout: Duration::from_millis(0),
            port_settle: Duration::from_millis(0),
            ready_delay: Duration::from_millis(0),
            tick: Duration::from_millis(0),
            flush_grace: Duration::from_millis(0),
            drain: Duration::from_millis(0),
        }
    }
}

/// Drives one treatment from server start through teardown. Owns all mutable
/// run state; single-threaded, coordination with the engine processes is
/// purely polling plus fixed sleeps.
pub struct RunCtx<'a> {
    treatment: &'a Treatment,
    engine: &'static dyn Engine,
    server_cmd: String,
    client_cmd: String,
    procs: &'a mut dyn ProcOps,
    telemetry: &'a dyn Telemetry,
    tracer: Option<BlockTracer>,
    timings: Timings,

    phase: Phase,
    samples: SampleSeries,
    server: Option<ProcHandle>,
    client: Option<ProcHandle>,
    kb_read_base: u64,
}

impl<'a> RunCtx<'a> {
    pub fn new(
        treatment: &'a Treatment,
        engine: &'static dyn Engine,
        server_cmd: String,
        client_cmd: String,
        procs: &'a mut dyn ProcOps,
        telemetry: &'a dyn Telemetry,
        tracer: Option<BlockTracer>,
        timings: Timings,
    ) -> Self {
        Self {
            treatment,
            engine,
            server_cmd,
            client_cmd,
            procs,
            telemetry,
            tracer,
            timings,
            phase: Phase::Init,
            samples: SampleSeries::new(),
            server: None,
            client: None,
            kb_read_base: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        assert_eq!(self.phase, Phase::Init);

        self.set_phase(Phase::ServerStarting);
        info!("starting server: {}", &self.server_cmd);
        let server = self.procs.start_server(&self.server_cmd)?;
        self.server = Some(server);

        info!("waiting {:?} for the server to load its index", self.timings.warmup);
        sleep(self.timings.warmup);

        if !self.wait_server_port()? {
            self.set_phase(Phase::ServerCrashed);
            return Ok(RunOutcome::ServerCrashed);
        }
        self.set_phase(Phase::ServerReady);

        // The baseline must land strictly before the client starts issuing
        // queries or the KB-read delta is meaningless.
        self.kb_read_base = self.telemetry.device_kb_read()?;
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.start()?;
        }
        sleep(self.timings.ready_delay);

        self.set_phase(Phase::ClientRunning);
        info!("starting client: {}", &self.client_cmd);
        let client = self.procs.start_client(&self.client_cmd)?;
        self.client = Some(client);
        sleep(self.engine.client_start_delay());

        self.monitor()
    }

    fn wait_server_port(&self) -> Result<bool> {
        let name = self.engine.server_proc();
        let give_up = Instant::now() + self.timings.port_timeout;

        info!("waiting for {} to open its port", name);
        while !self.procs.port_open(name)? {
            if Instant::now() >= give_up {
                error!(
                    "{} port not reachable within {:?}, giving up on this treatment",
                    name, self.timings.port_timeout
                );
                return Ok(false);
            }
            sleep(self.timings.port_poll);
        }
        sleep(self.timings.port_settle);
        Ok(true)
    }

    fn client_finished(&self) -> Result<bool> {
        Ok(match self.procs.client_tail()? {
            Some(line) => line == FINISH_SENTINEL,
            None => false,
        })
    }

    fn monitor(&mut self) -> Result<RunOutcome> {
        self.set_phase(Phase::Monitoring);
        let server_name = self.engine.server_proc();
        let client_name = self.engine.client_proc();
        let mut ticks = 0u64;

        loop {
            if !self.procs.server_running(server_name)? {
                error!("server crashed, see crash.log and dmesg for details");
                self.set_phase(Phase::ServerCrashed);
                return Ok(RunOutcome::ServerCrashed);
            }

            let client_alive = self.procs.client_running(client_name)?;
            if !client_alive {
                // Normal completion races with liveness: the client may have
                // exited with its last lines still buffered. Kill whatever
                // lingers and give the output time to reach the file before
                // deciding anything.
                self.procs.terminate_client(client_name)?;
                debug!("client gone, waiting {:?} for its output to flush", self.timings.flush_grace);
                sleep(self.timings.flush_grace);
            }

            if self.client_finished()? {
                return self.finish();
            }

            if !client_alive {
                error!("client is not running and never reported completion");
                self.set_phase(Phase::ClientCrashed);
                return Ok(RunOutcome::ClientCrashed);
            }

            let cache_mb = self.telemetry.page_cache_mb()?;
            self.samples.push(cache_mb);
            ticks += 1;
            debug!("tick {}: page cache {} MB", ticks, cache_mb);
            sleep(self.timings.tick);
        }
    }

    fn finish(&mut self) -> Result<RunOutcome> {
        self.set_phase(Phase::Finishing);

        self.procs.terminate_client(self.engine.client_proc())?;
        if self.engine.graceful_server_stop() {
            if let Some(server) = self.server.as_ref() {
                info!("interrupting server process group for graceful shutdown");
                self.procs.interrupt_server_group(server)?;
            }
        }
        sleep(self.timings.drain);

        if let Some(tracer) = self.tracer.as_mut() {
            tracer.stop();
        }

        // Final counter strictly after teardown so the delta covers the
        // whole run including shutdown writeback.
        let kb_read_final = self.telemetry.device_kb_read()?;
        let kb_read = kb_read_final.saturating_sub(self.kb_read_base);
        info!("device KB read over the run: {}", kb_read);

        let metrics = self
            .engine
            .parse_client_output(&self.procs.client_output()?);

        let record = ResultRecord {
            metrics,
            cache_mb_median: self.samples.median(),
            cache_mb_max: self.samples.max(),
            kb_read,
            tags: workload_tags(&self.treatment.query_path),
            treatment: self.treatment.clone(),
        };

        self.set_phase(Phase::Done);
        Ok(RunOutcome::Done(Box::new(record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::engine_for;
    use se_bench_intf::EngineKind;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn dfl_treatment(engine: EngineKind) -> Treatment {
        Treatment {
            server_mem_size: 8 << 30,
            n_server_threads: 25,
            n_client_threads: 128,
            query_path: "/mnt/ssd/workloads/type_single.docfreq_low".into(),
            engine,
            init_heap_size: 300 << 20,
            max_heap_size: 300 << 20,
            lock_memory: false,
            read_ahead_kb: 32,
            prefetch_threshold_kb: 128,
            enable_prefetch: true,
        }
    }

    /// Scripted collaborator. Each VecDeque yields per-call answers and
    /// repeats its last entry once exhausted.
    #[derive(Default)]
    struct MockProcs {
        port_open: RefCell<VecDeque<bool>>,
        server_alive: RefCell<VecDeque<bool>>,
        client_alive: RefCell<VecDeque<bool>>,
        tails: RefCell<VecDeque<Option<String>>>,
        output: String,

        started: Vec<String>,
        nr_client_kills: usize,
        interrupted: RefCell<bool>,
    }

    fn pop_scripted<T: Clone>(q: &RefCell<VecDeque<T>>, dfl: T) -> T {
        let mut q = q.borrow_mut();
        match q.len() {
            0 => dfl,
            1 => q.front().unwrap().clone(),
            _ => q.pop_front().unwrap(),
        }
    }

    impl MockProcs {
        fn script<T: Clone>(vals: &[T]) -> RefCell<VecDeque<T>> {
            RefCell::new(vals.iter().cloned().collect())
        }
    }

    impl ProcOps for MockProcs {
        fn start_server(&mut self, cmd: &str) -> Result<ProcHandle> {
            self.started.push(cmd.to_string());
            Ok(ProcHandle {
                pid: Some(100),
                name: "server".into(),
            })
        }

        fn start_client(&mut self, cmd: &str) -> Result<ProcHandle> {
            self.started.push(cmd.to_string());
            Ok(ProcHandle {
                pid: Some(200),
                name: "client".into(),
            })
        }

        fn server_running(&self, _name: &str) -> Result<bool> {
            Ok(pop_scripted(&self.server_alive, true))
        }

        fn client_running(&self, _name: &str) -> Result<bool> {
            Ok(pop_scripted(&self.client_alive, true))
        }

        fn port_open(&self, _name: &str) -> Result<bool> {
            Ok(pop_scripted(&self.port_open, true))
        }

        fn terminate_client(&mut self, _name: &str) -> Result<()> {
            self.nr_client_kills += 1;
            Ok(())
        }

        fn interrupt_server_group(&self, _handle: &ProcHandle) -> Result<()> {
            *self.interrupted.borrow_mut() = true;
            Ok(())
        }

        fn client_tail(&self) -> Result<Option<String>> {
            Ok(pop_scripted(&self.tails, None))
        }

        fn client_output(&self) -> Result<String> {
            Ok(self.output.clone())
        }
    }

    struct MockTelemetry {
        kb_read: RefCell<VecDeque<u64>>,
        cache_mb: u64,
    }

    impl MockTelemetry {
        fn new(kb_reads: &[u64], cache_mb: u64) -> Self {
            Self {
                kb_read: RefCell::new(kb_reads.iter().copied().collect()),
                cache_mb,
            }
        }
    }

    impl Telemetry for MockTelemetry {
        fn page_cache_mb(&self) -> Result<u64> {
            Ok(self.cache_mb)
        }

        fn device_kb_read(&self) -> Result<u64> {
            Ok(pop_scripted(&self.kb_read, 0))
        }
    }

    fn run_one(
        treatment: &Treatment,
        procs: &mut MockProcs,
        telemetry: &MockTelemetry,
    ) -> (Result<RunOutcome>, Phase) {
        let _ = env_logger::try_init();
        let engine = engine_for(treatment.engine);
        let mut rctx = RunCtx::new(
            treatment,
            engine,
            "server-cmd".into(),
            "client-cmd".into(),
            procs,
            telemetry,
            None,
            Timings::test(),
        );
        let outcome = rctx.run();
        let phase = rctx.phase();
        (outcome, phase)
    }

    #[test]
    fn test_normal_completion_graceful_engine() {
        let treatment = dfl_treatment(EngineKind::Custom);
        let mut procs = MockProcs {
            tails: MockProcs::script(&[
                Some("warming up".to_string()),
                Some(FINISH_SENTINEL.to_string()),
            ]),
            output: "count latency_50th latency_95th\n120 2.0 4.5\nExperimentFinished!!!\n"
                .to_string(),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[1000, 5000], 250);

        let (outcome, phase) = run_one(&treatment, &mut procs, &telemetry);
        let record = match outcome.unwrap() {
            RunOutcome::Done(record) => record,
            v => panic!("expected Done, got {:?}", v),
        };

        assert_eq!(phase, Phase::Done);
        assert_eq!(record.kb_read, 4000);
        assert_eq!(record.metrics["latency_95th"], "4.5");
        // One sample taken on the non-final tick.
        assert_eq!(record.cache_mb_median, Some(250.0));
        assert_eq!(record.cache_mb_max, 250);
        assert_eq!(record.tags["docfreq"], "low");
        // Custom engine wants a graceful server stop.
        assert!(*procs.interrupted.borrow());
        assert!(procs.nr_client_kills >= 1);
    }

    #[test]
    fn test_sentinel_must_match_exactly() {
        let treatment = dfl_treatment(EngineKind::Lucene);
        let mut procs = MockProcs {
            tails: MockProcs::script(&[
                Some("XExperimentFinished!!!Y".to_string()),
                Some("ExperimentFinished!!".to_string()),
                Some(FINISH_SENTINEL.to_string()),
            ]),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[0, 0], 10);

        let (outcome, _) = run_one(&treatment, &mut procs, &telemetry);
        let record = match outcome.unwrap() {
            RunOutcome::Done(record) => record,
            v => panic!("expected Done, got {:?}", v),
        };
        // The two near-miss lines must not complete the run; both cost a tick.
        assert_eq!(record.cache_mb_median, Some(10.0));
        assert_eq!(record.cache_mb_max, 10);
    }

    #[test]
    fn test_server_crash_mid_monitoring() {
        let treatment = dfl_treatment(EngineKind::Custom);
        let mut procs = MockProcs {
            server_alive: MockProcs::script(&[true, false]),
            tails: MockProcs::script(&[Some("working".to_string())]),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[0], 10);

        let (outcome, phase) = run_one(&treatment, &mut procs, &telemetry);
        assert!(matches!(outcome.unwrap(), RunOutcome::ServerCrashed));
        assert_eq!(phase, Phase::ServerCrashed);
    }

    #[test]
    fn test_client_crash() {
        let treatment = dfl_treatment(EngineKind::Lucene);
        let mut procs = MockProcs {
            client_alive: MockProcs::script(&[false]),
            tails: MockProcs::script(&[Some("partial output".to_string())]),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[0], 10);

        let (outcome, phase) = run_one(&treatment, &mut procs, &telemetry);
        assert!(matches!(outcome.unwrap(), RunOutcome::ClientCrashed));
        assert_eq!(phase, Phase::ClientCrashed);
        // The grace-period recovery force-killed the lingering handle.
        assert_eq!(procs.nr_client_kills, 1);
    }

    #[test]
    fn test_client_exit_with_flushed_sentinel_is_not_a_crash() {
        let treatment = dfl_treatment(EngineKind::Lucene);
        // Client already gone, but after the flush grace its output ends with
        // the sentinel: the normal completion race, not a crash.
        let mut procs = MockProcs {
            client_alive: MockProcs::script(&[false]),
            tails: MockProcs::script(&[Some(FINISH_SENTINEL.to_string())]),
            output: "Throughput: 99.9\nLatencies: 1, 2, 3\nExperimentFinished!!!\n".to_string(),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[100, 100], 10);

        let (outcome, phase) = run_one(&treatment, &mut procs, &telemetry);
        let record = match outcome.unwrap() {
            RunOutcome::Done(record) => record,
            v => panic!("expected Done, got {:?}", v),
        };
        assert_eq!(phase, Phase::Done);
        assert_eq!(record.kb_read, 0);
        // No monitoring tick completed, so no samples: NA median, zero max.
        assert_eq!(record.cache_mb_median, None);
        assert_eq!(record.cache_mb_max, 0);
        assert_eq!(record.metrics["QPS"], "99");
    }

    #[test]
    fn test_port_timeout_is_server_crash() {
        let treatment = dfl_treatment(EngineKind::Custom);
        let mut procs = MockProcs {
            port_open: MockProcs::script(&[false]),
            ..Default::default()
        };
        let telemetry = MockTelemetry::new(&[0], 0);

        let (outcome, phase) = run_one(&treatment, &mut procs, &telemetry);
        assert!(matches!(outcome.unwrap(), RunOutcome::ServerCrashed));
        assert_eq!(phase, Phase::ServerCrashed);
        // Only the server was ever started.
        assert_eq!(procs.started.len(), 1);
    }
}
