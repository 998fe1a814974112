// cellar/src/cli/test.rs

use cellar_common::config::Config;
use cellar_common::error::{CellarError, Result};
use cellar_common::formulary::Formulary;
use cellar_common::model::artifact::VerificationStatus;
use cellar_core::verify_installed;
use clap::Args;
use colored::Colorize;
use tokio::sync::watch;

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Formula whose newest installed keg is checked
    name: String,
}

impl TestArgs {
    pub async fn run(&self, config: &Config, cancel: watch::Receiver<bool>) -> Result<()> {
        let formula = Formulary::new(config).load_formula(&self.name)?;
        println!("Testing {}...", self.name.cyan());
        let outcome = verify_installed(config, &formula, Some(cancel)).await;
        if let Some(line) = summary(&self.name, &outcome) {
            println!("{line}");
        }
        // A failed check is an error so the exit code reports it.
        outcome.map(|_| ())
    }
}

/// Verdict line for a verification outcome; other errors are left to the caller.
fn summary(name: &str, outcome: &Result<VerificationStatus>) -> Option<String> {
    match outcome {
        Ok(VerificationStatus::NotRun) => Some(format!("{} defines no test; nothing to verify", name.cyan())),
        Ok(_) => Some(format!("{} {}", "✓".green().bold(), "Verification passed".green())),
        Err(CellarError::InstallationVerification { .. }) => {
            Some(format!("{} {}", "✗".red().bold(), "Verification failed".red()))
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_arrive_as_errors() {
        colored::control::set_override(false);
        let failed = Err(CellarError::InstallationVerification {
            name: "nektar".into(),
            version: "5.2.0".into(),
            message: "line 2: 1.25 and 9.75 differ".into(),
        });
        assert_eq!(summary("nektar", &failed).as_deref(), Some("✗ Verification failed"));
        assert_eq!(
            summary("nektar", &Ok(VerificationStatus::Passed)).as_deref(),
            Some("✓ Verification passed")
        );
        assert_eq!(
            summary("nektar", &Ok(VerificationStatus::NotRun)).as_deref(),
            Some("nektar defines no test; nothing to verify")
        );
        let missing = Err(CellarError::NotFound("nektar is not installed".into()));
        assert_eq!(summary("nektar", &missing), None);
    }
}
