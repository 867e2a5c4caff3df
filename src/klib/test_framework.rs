//! Framework de testes do kernel
//!
//! Suites de teste executáveis dentro do próprio kernel (feature
//! `self_test`), sem depender do harness da std. Cada subsistema expõe um
//! array de `TestCase` e o boot chama `run_test_suite`.

/// Resultado de teste
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Passed,
    Failed,
    Skipped,
}

/// Um caso de teste
pub struct TestCase {
    pub name: &'static str,
    pub func: fn() -> TestResult,
}

impl TestCase {
    pub const fn new(name: &'static str, func: fn() -> TestResult) -> Self {
        Self { name, func }
    }
}

/// Executa suite de testes. Retorna (passed, failed, skipped).
pub fn run_test_suite(name: &str, tests: &[TestCase]) -> (usize, usize, usize) {
    crate::klog!("=== Suite: ");
    crate::klog!(name);
    crate::klog!(" ===");
    crate::knl!();

    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;

    for test in tests {
        match (test.func)() {
            TestResult::Passed => {
                crate::kok!(test.name);
                passed += 1;
            }
            TestResult::Failed => {
                crate::kfail!(test.name);
                failed += 1;
            }
            TestResult::Skipped => {
                crate::kwarn!(test.name);
                skipped += 1;
            }
        }
    }

    crate::kinfo!("Passed=", passed);
    if failed > 0 {
        crate::kerror!("Failed=", failed);
    }
    (passed, failed, skipped)
}
