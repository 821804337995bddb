#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use arena_judge::config::{JudgeConfig, LimitsConfig, MilliSecond};
use arena_judge::judge::Judge;
use arena_judge::language::Language;
use arena_judge::queue::JobQueue;
use arena_judge::sandbox::{FilesystemPolicy, ProcessRunner};
use arena_judge::session::{
    ExecutionRequest, LimitProfile, Mode, PollResult, SessionManager,
};
use arena_judge::worker::worker;

pub const TWO_SUM: &str = r#"
class Solution:
    def twoSum(self, nums, target):
        seen = {}
        for i, n in enumerate(nums):
            if target - n in seen:
                return [seen[target - n], i]
            seen[n] = i
        return []
"#;

/// Reads one JSON case per stdin line and reports it in the CASE protocol
pub const TWO_SUM_DRIVER: &str = r#"
import json
import sys
from solution import Solution

case_id = 0
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    case_id += 1
    data = json.loads(line)
    inp, expected = data["input"], data["expected"]
    actual = Solution().twoSum(inp["nums"], inp["target"])
    status = "PASS" if actual == expected else "FAIL"
    print(f"CASE|{case_id}|{status}|{inp}|{actual}|{expected}")
"#;

/// Confined to its workspace wherever the kernel supports Landlock
pub fn sandboxed_runner() -> ProcessRunner {
    let runner = ProcessRunner::new(false);
    if FilesystemPolicy::is_supported() {
        runner.confine_filesystem(FilesystemPolicy::default())
    } else {
        runner
    }
}

/// A judge with its worker pool, torn down on drop
pub struct TestJudge {
    pub manager: Arc<SessionManager>,
    pub queue: Arc<JobQueue>,
    token: CancellationToken,
    _work_root: TempDir,
}

impl TestJudge {
    pub fn start(config: JudgeConfig) -> Self {
        let work_root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let judge = Arc::new(Judge::new(
            &config,
            work_root.path().to_path_buf(),
            Arc::new(sandboxed_runner()),
        ));
        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let manager = Arc::new(SessionManager::new(&config, queue.clone(), token.clone()));

        for i in 1..=config.workers {
            tokio::spawn(worker(i, judge.clone(), queue.clone(), token.clone()));
        }

        Self {
            manager,
            queue,
            token,
            _work_root: work_root,
        }
    }

    /// Polls until the session ends, returning all output and the last poll
    pub async fn drain(&self, session_id: &str) -> (String, PollResult) {
        let mut output = String::new();
        for _ in 0..400 {
            let poll = self.manager.poll(session_id).unwrap();
            output.push_str(&poll.output);
            if !poll.running {
                return (output, poll);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session {session_id} did not finish, output so far: {output:?}");
    }

    /// Waits until `n` workers are busy
    pub async fn wait_busy(&self, n: usize) {
        for _ in 0..400 {
            if self.manager.stats().await.busy_workers >= n && self.queue.len().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers never became busy");
    }
}

impl Drop for TestJudge {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Small limits so timeouts are reached quickly
pub fn test_config() -> JudgeConfig {
    JudgeConfig {
        workers: 2,
        queue_capacity: 4,
        batch_limits: LimitsConfig {
            time_limit: MilliSecond(1_500),
            ..LimitsConfig::batch()
        },
        playground_limits: LimitsConfig {
            time_limit: MilliSecond(10_000),
            ..LimitsConfig::playground()
        },
        idle_timeout: MilliSecond(2_000),
        ..JudgeConfig::default()
    }
}

pub fn python(code: &str, mode: Mode) -> ExecutionRequest {
    ExecutionRequest {
        language: Language::Python,
        source_code: code.to_string(),
        driver_code: None,
        test_data: None,
        mode,
        limits: match mode {
            Mode::Batch => LimitProfile::Judge,
            Mode::Interactive => LimitProfile::Playground,
        },
    }
}
