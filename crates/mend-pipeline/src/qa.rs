//! Browser test harness for the test stage.
//!
//! Two steps: the model synthesizes test-case descriptors from the applied
//! plan, then each case runs against a headless browser. The quality gate
//! decides whether the aggregate report clears the bar. A machine without
//! a browser produces a failed report with a structured reason — never a
//! crashed task.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mend_core::config::TestConfig;
use mend_core::types::{CaseResult, CaseStatus, TestReport};

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

/// One synthesized browser check: load `path` and expect `expect` to
/// appear in the rendered DOM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    #[serde(default = "default_path")]
    pub path: String,
    pub expect: String,
}

fn default_path() -> String {
    "/".into()
}

// ---------------------------------------------------------------------------
// BrowserRunner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrowserRunner: Send + Sync {
    /// Check the runner can execute at all. The error is the structured
    /// reason surfaced on the report.
    fn ensure_available(&self) -> Result<(), String>;

    /// Execute one case. Infallible at the type level: execution problems
    /// become a failed [`CaseResult`].
    async fn run_case(&self, base_url: &str, case: &TestCase, timeout: Duration) -> CaseResult;
}

// ---------------------------------------------------------------------------
// HeadlessBrowser
// ---------------------------------------------------------------------------

/// Runs cases through a headless Chrome/Chromium binary discovered from
/// the configured path or well-known install locations.
pub struct HeadlessBrowser {
    binary: Option<PathBuf>,
}

const BROWSER_CANDIDATES: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

impl HeadlessBrowser {
    pub fn discover(config: &TestConfig) -> Self {
        let binary = config
            .chrome_path
            .clone()
            .filter(|p| p.exists())
            .or_else(|| {
                BROWSER_CANDIDATES
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.exists())
            });
        match &binary {
            Some(path) => debug!(path = %path.display(), "headless browser located"),
            None => warn!("no headless browser binary found"),
        }
        Self { binary }
    }
}

#[async_trait]
impl BrowserRunner for HeadlessBrowser {
    fn ensure_available(&self) -> Result<(), String> {
        match &self.binary {
            Some(_) => Ok(()),
            None => Err("browser binary not found in CHROME_PATH or known locations".into()),
        }
    }

    async fn run_case(&self, base_url: &str, case: &TestCase, timeout: Duration) -> CaseResult {
        let Some(binary) = &self.binary else {
            return CaseResult {
                name: case.name.clone(),
                status: CaseStatus::Failed,
                error: Some("browser binary not available".into()),
            };
        };

        let url = format!("{}{}", base_url.trim_end_matches('/'), case.path);
        let command = tokio::process::Command::new(binary)
            .args(["--headless=new", "--disable-gpu", "--no-sandbox", "--dump-dom"])
            .arg(&url)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, command).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return CaseResult {
                    name: case.name.clone(),
                    status: CaseStatus::Failed,
                    error: Some(format!("browser launch failed: {e}")),
                }
            }
            Err(_) => {
                return CaseResult {
                    name: case.name.clone(),
                    status: CaseStatus::Failed,
                    error: Some(format!("case timed out after {timeout:?}")),
                }
            }
        };

        let dom = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && dom.contains(&case.expect) {
            CaseResult {
                name: case.name.clone(),
                status: CaseStatus::Passed,
                error: None,
            }
        } else {
            CaseResult {
                name: case.name.clone(),
                status: CaseStatus::Failed,
                error: Some(format!("expected text not found at {url}")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedBrowser
// ---------------------------------------------------------------------------

/// Test double: pops one scripted pass/fail per executed case. An empty
/// script passes everything.
pub struct ScriptedBrowser {
    outcomes: Mutex<Vec<bool>>,
    available: bool,
}

impl ScriptedBrowser {
    pub fn passing() -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
            available: true,
        }
    }

    /// Outcomes are consumed front to back, one per case.
    pub fn with_outcomes(outcomes: Vec<bool>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
            available: false,
        }
    }
}

#[async_trait]
impl BrowserRunner for ScriptedBrowser {
    fn ensure_available(&self) -> Result<(), String> {
        if self.available {
            Ok(())
        } else {
            Err("browser binary not found in CHROME_PATH or known locations".into())
        }
    }

    async fn run_case(&self, _base_url: &str, case: &TestCase, _timeout: Duration) -> CaseResult {
        let passed = {
            let mut outcomes = self.outcomes.lock().expect("outcomes poisoned");
            if outcomes.is_empty() {
                true
            } else {
                outcomes.remove(0)
            }
        };
        CaseResult {
            name: case.name.clone(),
            status: if passed {
                CaseStatus::Passed
            } else {
                CaseStatus::Failed
            },
            error: (!passed).then(|| "scripted failure".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

/// The bar a test report must clear: every case passed, at least
/// `min_cases` ran, and — when configured — the model's quality score
/// reached `min_score`.
#[derive(Debug, Clone)]
pub struct QualityGate {
    pub min_cases: usize,
    pub min_score: Option<f32>,
}

impl QualityGate {
    pub fn new(min_cases: usize) -> Self {
        Self {
            min_cases,
            min_score: None,
        }
    }

    /// `Err` carries the human-readable reason the gate failed.
    pub fn evaluate(&self, report: &TestReport, score: Option<f32>) -> Result<(), String> {
        if let Some(reason) = &report.reason {
            return Err(reason.clone());
        }
        if report.tests_passed != report.tests_run {
            return Err(format!(
                "{}/{} cases passed",
                report.tests_passed, report.tests_run
            ));
        }
        if report.tests_run < self.min_cases {
            return Err(format!(
                "only {} cases ran, {} required",
                report.tests_run, self.min_cases
            ));
        }
        if let Some(min) = self.min_score {
            match score {
                Some(s) if s >= min => {}
                Some(s) => return Err(format!("quality score {s:.2} below threshold {min:.2}")),
                None => return Err("quality score unavailable".into()),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// Executes a batch of cases and aggregates the report. Case generation
/// lives in the test stage (it needs the model client); execution and
/// gating live here.
pub struct TestHarness {
    browser: std::sync::Arc<dyn BrowserRunner>,
    base_url: String,
    case_timeout: Duration,
    pub gate: QualityGate,
}

impl TestHarness {
    pub fn new(browser: std::sync::Arc<dyn BrowserRunner>, config: &TestConfig) -> Self {
        Self {
            browser,
            base_url: config.base_url.clone(),
            case_timeout: config.case_timeout,
            gate: QualityGate::new(config.min_cases),
        }
    }

    /// Run every case, reporting progress through `on_progress`
    /// (current, total, case name).
    pub async fn run_cases(
        &self,
        cases: &[TestCase],
        mut on_progress: impl FnMut(usize, usize, &str),
    ) -> TestReport {
        if let Err(reason) = self.browser.ensure_available() {
            return TestReport::environment_failure(reason);
        }

        let total = cases.len();
        let mut details = Vec::with_capacity(total);
        for (i, case) in cases.iter().enumerate() {
            on_progress(i + 1, total, &case.name);
            let result = self
                .browser
                .run_case(&self.base_url, case, self.case_timeout)
                .await;
            debug!(case = %case.name, status = ?result.status, "test case finished");
            details.push(result);
        }
        TestReport::from_cases(details)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
