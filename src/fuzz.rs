//! Fuzz engine
//!
//! Pops test cases from the input queue, runs every mutation strategy
//! against them, executes the mutated cases through the backend and
//! keeps the ones whose traces show new coverage. Crashing inputs are
//! persisted for triage.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backends::{Backend, BackendError, Execution};
use crate::config::Config;
use crate::feedback::Trace;
use crate::input::TestCase;
use crate::mangle::{strategies_for, Strategy, StrategyStats};

/// Error which aborts the whole fuzzing session
#[derive(Debug)]
pub enum FuzzError {
    /// Backend failure
    Backend(BackendError),
    /// Failure while persisting a crashing input
    Io(io::Error),
}

impl fmt::Display for FuzzError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FuzzError::Backend(error) => write!(f, "{}", error),
            FuzzError::Io(error) => write!(f, "Failed to persist a crashing input: {}", error),
        }
    }
}

impl From<BackendError> for FuzzError {
    fn from(error: BackendError) -> Self {
        FuzzError::Backend(error)
    }
}

impl From<io::Error> for FuzzError {
    fn from(error: io::Error) -> Self {
        FuzzError::Io(error)
    }
}

/// Counters rendered on the status line
#[derive(Debug)]
struct Metrics {
    start: Instant,
    executions: usize,
    paths: usize,
    crashes: usize,
    hangs: usize,
    last_path: Option<Instant>,
    last_crash: Option<Instant>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            executions: 0,
            paths: 0,
            crashes: 0,
            hangs: 0,
            last_path: None,
            last_crash: None,
        }
    }
}

/// Fuzzer engine state
pub struct Fuzzer {
    backend: Box<dyn Backend>,
    output_dir: PathBuf,
    verbose: bool,
    stat_interval: Duration,

    /// Cases awaiting strategy expansion
    input_queue: VecDeque<TestCase>,
    /// Strategies pending for the current case
    strategy_queue: VecDeque<Box<dyn Strategy>>,
    current_strategy: Option<Box<dyn Strategy>>,
    /// Accumulated union of every trace observed so far
    baseline: Option<Trace>,

    metrics: Metrics,
    last_render: Option<Instant>,
}

impl Fuzzer {
    /// Create a new `Fuzzer` instance over the seed test cases
    pub fn new(backend: Box<dyn Backend>, seeds: Vec<TestCase>, config: &Config) -> Self {
        Self {
            backend,
            output_dir: PathBuf::from(&config.io_config.output_dir),
            verbose: config.app_config.verbose,
            stat_interval: Duration::from_millis(config.app_config.stat_interval),
            input_queue: seeds.into(),
            strategy_queue: VecDeque::new(),
            current_strategy: None,
            baseline: None,
            metrics: Metrics::new(),
            last_render: None,
        }
    }

    /// Run the engine until the queues drain or `stop` is raised.
    /// Backend cleanup runs on every exit path.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), FuzzError> {
        let result = self.run_loop(stop);
        self.backend.cleanup();
        result
    }

    fn run_loop(&mut self, stop: &AtomicBool) -> Result<(), FuzzError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                self.log("Interrupted, cleaning up.");
                return Ok(());
            }

            let strategy = match self.current_strategy {
                Some(ref mut strategy) => strategy,
                None => {
                    if self.strategy_queue.is_empty() {
                        match self.input_queue.pop_front() {
                            Some(case) => {
                                self.strategy_queue = strategies_for(&case).into();
                            }
                            None => {
                                self.log("No more tasks to run, exiting.");
                                return Ok(());
                            }
                        }
                    }
                    self.current_strategy = self.strategy_queue.pop_front();
                    continue;
                }
            };

            let case = match strategy.gen_test() {
                Some(case) => case,
                None => {
                    self.current_strategy = None;
                    continue;
                }
            };

            let execution = self.backend.run(&case.data)?;
            self.metrics.executions += 1;

            match execution {
                Execution::Hung => {
                    self.metrics.hangs += 1;
                    if self.verbose {
                        self.log(&format!("Hang on {} [{}]", case.name, case.mutations));
                    }
                }
                Execution::Completed(trace) => self.classify(case, trace)?,
            }

            self.render_stats();
        }
    }

    /// Sort one completed execution: persist crashes, enqueue novel
    /// cases and fold the trace into the baseline
    fn classify(&mut self, case: TestCase, trace: Trace) -> Result<(), FuzzError> {
        if trace.did_crash {
            self.metrics.crashes += 1;
            self.metrics.last_crash = Some(Instant::now());
            self.persist_crash(&case, &trace)?;
        } else if let Some(ref baseline) = self.baseline {
            if trace.compare_to(baseline) {
                if self.verbose {
                    self.log(&format!(
                        "New coverage from {} [{}]",
                        case.name, case.mutations
                    ));
                }
                self.input_queue.push_back(case);
            }
        }

        if let Some(ref mut baseline) = self.baseline {
            trace.combine_into(baseline);
        } else {
            // The very first trace seeds the baseline
            self.baseline = Some(trace);
        }

        let paths = self
            .baseline
            .as_ref()
            .map_or(0, |baseline| baseline.number_of_paths());
        if paths > self.metrics.paths {
            self.metrics.paths = paths;
            self.metrics.last_path = Some(Instant::now());
        }

        Ok(())
    }

    /// Write the crashing input to `<output>/input_<k>`
    fn persist_crash(&mut self, case: &TestCase, trace: &Trace) -> io::Result<()> {
        fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join(format!("input_{}", self.metrics.crashes));
        case.write_to(&path)?;

        if self.verbose {
            self.log(&format!(
                "Crash #{} (signal {}) from {} saved to {:?} [{}]",
                self.metrics.crashes, trace.exit_signal, case.name, path, case.mutations
            ));
        }

        Ok(())
    }

    /// Print a full line without corrupting the status line
    fn log(&self, message: &str) {
        println!("\r{:<120}", message);
    }

    /// Render the one line status display. The line overwrites itself
    /// and is throttled to the configured refresh interval.
    fn render_stats(&mut self) {
        if let Some(last) = self.last_render {
            if last.elapsed() < self.stat_interval {
                return;
            }
        }
        self.last_render = Some(Instant::now());

        let stats = self
            .current_strategy
            .as_ref()
            .map(|strategy| strategy.get_stats())
            .unwrap_or(StrategyStats {
                name: "-",
                percent: 0.0,
            });

        let line = format!(
            "[{}] execs: {} | paths: {} (last {}) | crashes: {} (last {}) | hangs: {} | queue: {}/{} | {} {:.1}%",
            format_elapsed(self.metrics.start.elapsed()),
            self.metrics.executions,
            self.metrics.paths,
            format_since(self.metrics.last_path),
            self.metrics.crashes,
            format_since(self.metrics.last_crash),
            self.metrics.hangs,
            self.input_queue.len(),
            self.strategy_queue.len(),
            stats.name,
            stats.percent,
        );
        print!("\r{:<120}", line);
        let _ = io::stdout().flush();
    }
}

/// Render a duration as hh:mm:ss
fn format_elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Render the time elapsed since an optional instant
fn format_since(instant: Option<Instant>) -> String {
    match instant {
        Some(instant) => format!("{}s ago", instant.elapsed().as_secs()),
        None => String::from("never"),
    }
}

#[cfg(test)]
mod tests {
    use super::{format_elapsed, Fuzzer};

    use std::collections::VecDeque;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::backends::{Backend, Execution, Result as BackendResult};
    use crate::config::{AppConfig, BackendKind, Config, ExeConfig, IOConfig};
    use crate::feedback::{Trace, MAP_SIZE};
    use crate::input::TestCase;

    /// Replays a scripted list of outcomes, then clean empty traces
    struct ScriptedBackend {
        script: VecDeque<Execution>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Execution>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl Backend for ScriptedBackend {
        fn run(&mut self, _data: &[u8]) -> BackendResult<Execution> {
            Ok(self
                .script
                .pop_front()
                .unwrap_or_else(|| Execution::Completed(clean_trace(&[]))))
        }

        fn cleanup(&mut self) {}
    }

    /// Crashes on every execution
    struct CrashingBackend;

    impl Backend for CrashingBackend {
        fn run(&mut self, _data: &[u8]) -> BackendResult<Execution> {
            let mut map = vec![0u8; MAP_SIZE];
            map[1] = 1;
            Ok(Execution::Completed(Trace::new(
                map,
                true,
                11,
                0,
                Duration::from_millis(1),
            )))
        }

        fn cleanup(&mut self) {}
    }

    fn clean_trace(cells: &[usize]) -> Trace {
        let mut map = vec![0u8; MAP_SIZE];
        for &index in cells {
            map[index] = 1;
        }
        Trace::new(map, false, 0, 0, Duration::from_millis(1))
    }

    fn test_config(output_dir: &Path) -> Config {
        Config {
            io_config: IOConfig {
                input_dir: String::from("."),
                output_dir: output_dir.to_string_lossy().into_owned(),
                work_dir: String::from("."),
            },
            exe_config: ExeConfig {
                target: String::from("/bin/true"),
                backend: BackendKind::Qemu,
            },
            app_config: AppConfig {
                verbose: false,
                timeout: 0,
                stat_interval: 1000,
            },
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("raclette_fuzz_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_no_coverage_terminates_naturally() {
        let output = scratch_dir("nocov");
        let config = test_config(&output);

        // Seed of one byte: null 1 + bitflip 8 + addsub 5 + runs 1
        let seeds = vec![TestCase::new(vec![0x41], "seed")];
        let mut fuzzer = Fuzzer::new(Box::new(ScriptedBackend::new(Vec::new())), seeds, &config);

        let stop = AtomicBool::new(false);
        fuzzer.run(&stop).unwrap();

        assert_eq!(fuzzer.metrics.executions, 15);
        assert_eq!(fuzzer.metrics.crashes, 0);
        assert_eq!(fuzzer.metrics.paths, 0);
        assert!(fuzzer.input_queue.is_empty());
        assert!(!output.exists());
    }

    #[test]
    fn test_crashes_are_persisted_not_enqueued() {
        let output = scratch_dir("crash");
        let config = test_config(&output);

        let seeds = vec![TestCase::new(b"Hi".to_vec(), "seed")];
        let mut fuzzer = Fuzzer::new(Box::new(CrashingBackend), seeds, &config);

        let stop = AtomicBool::new(false);
        fuzzer.run(&stop).unwrap();

        // 1 null + 16 bitflip + 10 addsub + 3 runs
        assert_eq!(fuzzer.metrics.executions, 30);
        assert_eq!(fuzzer.metrics.crashes, 30);
        assert!(fuzzer.input_queue.is_empty());

        // One file per crash, the first one holding the pristine seed
        assert_eq!(fs::read_dir(&output).unwrap().count(), 30);
        assert_eq!(fs::read(output.join("input_1")).unwrap(), b"Hi");

        let _ = fs::remove_dir_all(&output);
    }

    #[test]
    fn test_novel_traces_enqueue_their_case() {
        let output = scratch_dir("novel");
        let config = test_config(&output);

        // Zero length seed: only the null strategy emits. The second
        // execution shows a disjoint edge, so its case re-enters the
        // queue and runs the null strategy once more.
        let seeds = vec![
            TestCase::new(Vec::new(), "a"),
            TestCase::new(Vec::new(), "b"),
        ];
        let script = vec![
            Execution::Completed(clean_trace(&[10])),
            Execution::Completed(clean_trace(&[20])),
            Execution::Completed(clean_trace(&[])),
        ];
        let mut fuzzer = Fuzzer::new(Box::new(ScriptedBackend::new(script)), seeds, &config);

        let stop = AtomicBool::new(false);
        fuzzer.run(&stop).unwrap();

        assert_eq!(fuzzer.metrics.executions, 3);
        // Disjoint edge sets merge into the sum of both path counts
        assert_eq!(fuzzer.metrics.paths, 2);
        assert_eq!(fuzzer.metrics.crashes, 0);
    }

    #[test]
    fn test_first_trace_seeds_baseline_without_enqueue() {
        let output = scratch_dir("baseline");
        let config = test_config(&output);

        let seeds = vec![TestCase::new(Vec::new(), "a")];
        let script = vec![Execution::Completed(clean_trace(&[10, 11, 12]))];
        let mut fuzzer = Fuzzer::new(Box::new(ScriptedBackend::new(script)), seeds, &config);

        let stop = AtomicBool::new(false);
        fuzzer.run(&stop).unwrap();

        // The seeding trace never re-enqueues its own case
        assert_eq!(fuzzer.metrics.executions, 1);
        assert_eq!(fuzzer.metrics.paths, 3);
    }

    #[test]
    fn test_hangs_are_counted_not_merged() {
        let output = scratch_dir("hang");
        let config = test_config(&output);

        let seeds = vec![
            TestCase::new(Vec::new(), "a"),
            TestCase::new(Vec::new(), "b"),
        ];
        let script = vec![
            Execution::Completed(clean_trace(&[10])),
            Execution::Hung,
        ];
        let mut fuzzer = Fuzzer::new(Box::new(ScriptedBackend::new(script)), seeds, &config);

        let stop = AtomicBool::new(false);
        fuzzer.run(&stop).unwrap();

        assert_eq!(fuzzer.metrics.executions, 2);
        assert_eq!(fuzzer.metrics.hangs, 1);
        assert_eq!(fuzzer.metrics.paths, 1);
    }

    #[test]
    fn test_stop_flag_halts_the_loop() {
        let output = scratch_dir("stop");
        let config = test_config(&output);

        let seeds = vec![TestCase::new(vec![0u8; 64], "seed")];
        let mut fuzzer = Fuzzer::new(Box::new(ScriptedBackend::new(Vec::new())), seeds, &config);

        let stop = AtomicBool::new(true);
        fuzzer.run(&stop).unwrap();

        assert_eq!(fuzzer.metrics.executions, 0);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "01:02:03");
    }
}
