//! Ordered fallback strategies
//!
//! Strategies are tried in order; the first candidate that passes validation
//! is accepted and later strategies are never invoked.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::geojson::write_empty_collection;
use super::validate::Reason;

/// One way of turning an input into a candidate output file
#[async_trait]
pub trait ExportStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a candidate at `out`. The candidate is validated by the chain.
    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason>;
}

/// Validates a candidate, returning its feature count
pub type Validator = fn(&Path) -> Result<u64, Reason>;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub strategy: String,
    pub reason: Reason,
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub strategy: String,
    pub path: PathBuf,
    pub features: u64,
    pub rejected: Vec<Attempt>,
}

/// Every strategy failed
#[derive(Debug, Clone, thiserror::Error)]
#[error("all {} strategies failed", .attempts.len())]
pub struct Exhausted {
    pub attempts: Vec<Attempt>,
}

pub struct FallbackChain {
    strategies: Vec<Box<dyn ExportStrategy>>,
    validator: Validator,
}

impl FallbackChain {
    pub fn new(strategies: Vec<Box<dyn ExportStrategy>>, validator: Validator) -> Self {
        Self {
            strategies,
            validator,
        }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// First success wins. Each strategy writes to its own candidate path
    /// derived from `out`, so a rejected candidate never shadows a later one.
    pub async fn run(&self, input: &Path, out: &Path) -> Result<Accepted, Exhausted> {
        let mut rejected = Vec::new();

        for (index, strategy) in self.strategies.iter().enumerate() {
            let candidate = candidate_path(out, index);
            let result = match strategy.attempt(input, &candidate).await {
                Ok(path) => (self.validator)(&path).map(|features| (path, features)),
                Err(reason) => Err(reason),
            };

            match result {
                Ok((path, features)) => {
                    info!(strategy = strategy.name(), features, "Fallback strategy accepted");
                    return Ok(Accepted {
                        strategy: strategy.name().to_string(),
                        path,
                        features,
                        rejected,
                    });
                }
                Err(reason) => {
                    warn!(strategy = strategy.name(), reason = %reason, "Fallback strategy rejected");
                    match std::fs::remove_file(&candidate) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            debug!(path = %candidate.display(), "Rejected strategy left no candidate");
                        }
                        Err(e) => {
                            warn!(path = %candidate.display(), error = %e, "Failed to remove rejected candidate");
                        }
                    }
                    rejected.push(Attempt {
                        strategy: strategy.name().to_string(),
                        reason,
                    });
                }
            }
        }

        Err(Exhausted { attempts: rejected })
    }

    /// Like [`run`](Self::run) but never fails: when every strategy is
    /// rejected an empty feature collection is written to `out` and logged as
    /// data loss. Returns `None` in that case.
    pub async fn run_or_empty(&self, input: &Path, out: &Path) -> anyhow::Result<Option<Accepted>> {
        match self.run(input, out).await {
            Ok(accepted) => {
                if accepted.path != out {
                    std::fs::rename(&accepted.path, out)?;
                }
                Ok(Some(Accepted {
                    path: out.to_path_buf(),
                    ..accepted
                }))
            }
            Err(exhausted) => {
                let reasons: Vec<String> = exhausted
                    .attempts
                    .iter()
                    .map(|a| format!("{}: {}", a.strategy, a.reason))
                    .collect();
                error!(
                    input = %input.display(),
                    ?reasons,
                    "All extraction strategies failed, substituting an empty feature collection (data loss)"
                );
                write_empty_collection(out)?;
                Ok(None)
            }
        }
    }
}

fn candidate_path(out: &Path, index: usize) -> PathBuf {
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "candidate".to_string());
    out.with_file_name(format!(".{}.{}", index, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        content: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExportStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(&self, _input: &Path, out: &Path) -> Result<PathBuf, Reason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.content {
                Some(content) => {
                    std::fs::write(out, content)?;
                    Ok(out.to_path_buf())
                }
                None => Err(Reason::new("tool failed")),
            }
        }
    }

    fn non_empty(path: &Path) -> Result<u64, Reason> {
        let text = std::fs::read_to_string(path)?;
        if text.is_empty() {
            Err(Reason::new("empty"))
        } else {
            Ok(text.len() as u64)
        }
    }

    fn strategy(name: &'static str, content: Option<&'static str>) -> (Box<dyn ExportStrategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Fixed {
                name,
                content,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_first_valid_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (s1, c1) = strategy("s1", None);
        let (s2, c2) = strategy("s2", Some("second"));
        let (s3, c3) = strategy("s3", Some("third"));
        let chain = FallbackChain::new(vec![s1, s2, s3], non_empty);

        let out = dir.path().join("out.txt");
        let accepted = chain.run(Path::new("in"), &out).await.unwrap();

        assert_eq!(accepted.strategy, "s2");
        assert_eq!(std::fs::read_to_string(&accepted.path).unwrap(), "second");
        assert_eq!(accepted.rejected.len(), 1);
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(c3.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_output_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let (s1, _) = strategy("exits-zero-but-empty", Some(""));
        let (s2, _) = strategy("real", Some("data"));
        let chain = FallbackChain::new(vec![s1, s2], non_empty);

        let accepted = chain.run(Path::new("in"), &dir.path().join("o")).await.unwrap();
        assert_eq!(accepted.strategy, "real");
        assert_eq!(accepted.rejected[0].reason, Reason::new("empty"));
    }

    #[tokio::test]
    async fn test_rejected_candidates_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (wrote_empty, _) = strategy("wrote-empty", Some(""));
        let (wrote_nothing, _) = strategy("wrote-nothing", None);
        let (real, _) = strategy("real", Some("data"));
        let chain = FallbackChain::new(vec![wrote_empty, wrote_nothing, real], non_empty);
        let out = dir.path().join("o");

        let accepted = chain.run(Path::new("in"), &out).await.unwrap();

        assert_eq!(accepted.rejected.len(), 2);
        assert!(!candidate_path(&out, 0).exists());
        assert!(!candidate_path(&out, 1).exists());
        assert_eq!(accepted.path, candidate_path(&out, 2));
    }

    #[tokio::test]
    async fn test_exhausted_substitutes_empty_collection() {
        let dir = tempfile::tempdir().unwrap();
        let (s1, _) = strategy("a", None);
        let (s2, _) = strategy("b", None);
        let chain = FallbackChain::new(vec![s1, s2], non_empty);
        let out = dir.path().join("fc.geojson");

        assert_eq!(chain.run(Path::new("in"), &out).await.unwrap_err().attempts.len(), 2);

        let accepted = chain.run_or_empty(Path::new("in"), &out).await.unwrap();
        assert!(accepted.is_none());
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("\"features\":[]"));
    }

    #[tokio::test]
    async fn test_run_or_empty_moves_accepted_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let (s1, _) = strategy("only", Some("payload"));
        let chain = FallbackChain::new(vec![s1], non_empty);
        let out = dir.path().join("fc.geojson");

        let accepted = chain.run_or_empty(Path::new("in"), &out).await.unwrap().unwrap();
        assert_eq!(accepted.path, out);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "payload");
    }
}
